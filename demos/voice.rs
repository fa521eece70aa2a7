use async_trait::async_trait;
use shardline::prelude::*;
use tokio::sync::Mutex;

const PREFIX: &str = "!";

struct Handler {
    voice: Mutex<Option<VoiceSession>>,
}

fn parse_command(content: &str) -> Option<(&str, &str)> {
    let trimmed = content.strip_prefix(PREFIX)?;
    match trimmed.find(' ') {
        Some(pos) => Some((&trimmed[..pos], trimmed[pos + 1..].trim())),
        None => Some((trimmed, "")),
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn on_ready(&self, ctx: Context, ready: Ready) {
        println!("shard {} logged in as {}", ctx.shard_id, ready.user.username);
    }

    async fn on_message(&self, ctx: Context, msg: Message) {
        if msg.author.is_bot() {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        let Some((cmd, args)) = msg.content.as_deref().and_then(parse_command) else {
            return;
        };
        let channel = args.parse::<u64>().ok().map(Snowflake::new);

        let mut voice = self.voice.lock().await;
        let result = match (cmd, channel, voice.as_ref()) {
            ("join", Some(channel), None) => match ctx.voice_connect(guild_id, channel).await {
                Ok(session) => {
                    *voice = Some(session);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ("move", Some(channel), Some(session)) => session.move_to(channel).await,
            ("leave", _, Some(session)) => {
                let closed = session.close().await;
                *voice = None;
                closed
            }
            _ => return,
        };

        match result {
            Ok(()) => println!("{cmd}: ok, now {:?}", voice.as_ref().map(|s| s.state())),
            Err(e) => eprintln!("{cmd} failed: {e}"),
        }
    }
}

#[tokio::main]
async fn main() {
    let token = std::env::var("BOT_TOKEN").expect("Expected BOT_TOKEN in environment");

    let client = Client::builder(token)
        .event_handler(Handler {
            voice: Mutex::new(None),
        })
        .build()
        .expect("valid configuration");

    client.ready(|| println!("all shards ready"));

    let idle = UpdateStatusPayload::new(Status::Idle).activity(Activity::playing("hello"));
    client.on(EventKind::PresenceUpdate, |ctx, event| async move {
        let Event::PresenceUpdate(presence) = &*event else {
            return;
        };
        if let Ok(me) = ctx.current_user().await {
            if presence.user.id == me.id {
                println!("presence mirrored: {:?}", presence.status);
            }
        }
    });

    if let Err(e) = client.connect().await {
        eprintln!("Client error: {}", e);
        return;
    }
    if let Err(e) = client.emit(GatewayCommand::UpdateStatus(idle)).await {
        eprintln!("presence update failed: {}", e);
    }

    let _ = tokio::signal::ctrl_c().await;
    let _ = client.disconnect().await;
}
