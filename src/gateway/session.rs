/// What a shard needs to resume instead of identifying again.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
}

impl SessionInfo {
    pub const fn new() -> Self {
        Self {
            session_id: None,
            resume_gateway_url: None,
            sequence: None,
        }
    }

    pub fn set_session(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_gateway_url = resume_url;
    }

    /// Records a sequence number. Anything not newer than what we already
    /// have is ignored, and `false` is returned.
    pub fn observe_sequence(&mut self, sequence: u64) -> bool {
        match self.sequence {
            Some(current) if sequence <= current => false,
            _ => {
                self.sequence = Some(sequence);
                true
            }
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn resume_gateway_url(&self) -> Option<&str> {
        self.resume_gateway_url.as_deref()
    }

    pub const fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub const fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    pub fn clear(&mut self) {
        self.session_id = None;
        self.resume_gateway_url = None;
        self.sequence = None;
    }
}
