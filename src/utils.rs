use std::any::Any;

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Short random identifier for this process, used as the storage lock owner.
pub fn instance_id() -> String {
    use rand::Rng;

    let suffix: u32 = rand::thread_rng().gen();
    format!("courier-{}-{suffix:08x}", std::process::id())
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;

    use super::*;

    #[tokio::test]
    async fn extracts_panic_text() {
        let caught = async { panic!("boom {}", 42) }.catch_unwind().await;
        assert_eq!(panic_message(&*caught.unwrap_err()), "boom 42");

        let caught = async { std::panic::panic_any(7u8) }.catch_unwind().await;
        assert_eq!(panic_message(&*caught.unwrap_err()), "unknown panic payload");
    }

    #[test]
    fn instance_ids_differ() {
        assert_ne!(instance_id(), instance_id());
    }
}
