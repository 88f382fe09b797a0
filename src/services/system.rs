//! Ping/pong keyed by cookie.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::pending::PendingRequests;
use super::spawn_listener;
use crate::error::Result;
use crate::handler::{PacketPriority, ProtocolHandler};
use crate::protocol::{Packet, PingMessage};

pub struct SystemService {
    handler: ProtocolHandler,
    pongs: Arc<PendingRequests<u32, ()>>,
    timeout: Option<Duration>,
    listener: JoinHandle<()>,
}

impl SystemService {
    pub fn new(handler: ProtocolHandler, timeout: Option<Duration>) -> Self {
        let pongs = PendingRequests::new();
        let fulfill = pongs.clone();
        let drain = pongs.clone();
        let listener = spawn_listener(
            "system",
            &handler,
            move |packet| {
                if let Packet::Ping(PingMessage::Pong { cookie }) = packet {
                    if !fulfill.fulfill(cookie, ()) {
                        tracing::debug!("unsolicited pong {}", cookie);
                    }
                }
            },
            move || drain.fail_all(),
        );
        Self {
            handler,
            pongs,
            timeout,
            listener,
        }
    }

    /// Ping the watch and wait for the pong echoing `cookie`.
    pub async fn ping(&self, cookie: u32) -> Result<()> {
        let registration = self.pongs.register(cookie)?;
        self.handler
            .send(
                &Packet::Ping(PingMessage::Ping { cookie }),
                PacketPriority::Urgent,
            )
            .await?;
        registration.wait(self.timeout).await
    }
}

impl Drop for SystemService {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandlerConfig;
    use crate::error::PebblewireError;
    use crate::services::tests::fake_link;

    #[tokio::test]
    async fn test_ping_matches_cookie() {
        let mut link = fake_link();
        let handler = ProtocolHandler::spawn(link.streams(), &HandlerConfig::default());
        let service = SystemService::new(handler, None);

        let watch = async {
            let frame = link.written.recv().await.unwrap();
            assert_eq!(frame, Packet::Ping(PingMessage::Ping { cookie: 0xC0FFEE }).encode().unwrap());
            link.reply(Packet::Ping(PingMessage::Pong { cookie: 1 })).await;
            link.reply(Packet::Ping(PingMessage::Pong { cookie: 0xC0FFEE }))
                .await;
        };
        let (pong, ()) = tokio::join!(service.ping(0xC0FFEE), watch);
        pong.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout() {
        let mut link = fake_link();
        let handler = ProtocolHandler::spawn(link.streams(), &HandlerConfig::default());
        let service = SystemService::new(handler, Some(Duration::from_millis(500)));
        assert!(matches!(
            service.ping(5).await,
            Err(PebblewireError::RequestTimeout)
        ));
    }
}
