use serde::de::IgnoredAny;
use surkit::broker::Message;
use surkit::MsgHandler;
use tracing::{info, warn};

pub const USER_CREATED: &str = "user.created";

pub fn msg_handlers() -> Vec<MsgHandler> {
    vec![MsgHandler::new(USER_CREATED, on_user_created)]
}

async fn on_user_created(msg: Message) {
    if serde_json::from_slice::<IgnoredAny>(&msg.payload).is_err() {
        warn!(
            subject = %msg.subject,
            payload_size = msg.payload.len(),
            "user.created event is not valid JSON"
        );
        return;
    }
    info!(
        subject = %msg.subject,
        payload_size = msg.payload.len(),
        has_reply = msg.reply.is_some(),
        "user created"
    );
}
