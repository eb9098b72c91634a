//! Inbound frame dispatch.
//!
//! Listeners and loopback endpoints push [`Incoming`] frames into one
//! channel; the router handles each on its own task and answers with a
//! status byte once the frame has been validated and persisted, so a
//! sender only sees ACCEPTED for frames we will not lose. Replies the
//! frame triggers (acks, pongs, released messages) are sent after the
//! answer, never while the sender is waiting for it.

use crate::context::EngineContext;
use crate::delivery::DeliveryMachine;
use crate::error::{Error, Result};
use crate::handshake::HandshakeEngine;
use crate::protocol::{AckBody, AckType, Frame, WireType};
use crate::transport::{
    Inbound, IncomingReceiver, STATUS_ACCEPTED, STATUS_INVALID_PIN, STATUS_REJECTED,
};
use crate::worker::FollowUps;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Routes inbound frames to the handshake engine and delivery machine.
#[derive(Debug, Clone)]
pub struct Router {
    ctx: EngineContext,
    handshake: HandshakeEngine,
    delivery: DeliveryMachine,
}

impl Router {
    /// Router over `ctx`.
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            handshake: HandshakeEngine::new(ctx.clone()),
            delivery: DeliveryMachine::new(ctx.clone()),
            ctx,
        }
    }

    /// Handle one frame and send whatever it triggers.
    pub async fn handle(&self, inbound: &Inbound) -> Result<()> {
        self.process(inbound).await?.run(&self.ctx).await
    }

    /// Validate and persist one frame. Frames must arrive on the port
    /// their type is served on. Outbound replies are returned unsent.
    pub async fn process(&self, inbound: &Inbound) -> Result<FollowUps> {
        let frame = Frame::from_bytes(&inbound.frame)?;
        let expected = frame.wire_type.port(&self.ctx.config().transport);
        if inbound.port != expected {
            return Err(Error::Protocol(format!(
                "{:?} frame on port {}",
                frame.wire_type, inbound.port
            )));
        }

        let followups = match frame.wire_type {
            WireType::FriendRequest => {
                self.handshake.receive_phase1(&frame.body)?;
                FollowUps::default()
            }
            WireType::FriendRequestAccepted => self.handshake.accept_phase2(&frame.body)?.1,
            WireType::Ping => self.delivery.handle_ping(&frame)?,
            WireType::Pong => self.delivery.handle_pong(&frame)?,
            WireType::Message => self.delivery.handle_message(&frame).await?,
            WireType::Ack => {
                let ack: AckBody = frame.decode_body()?;
                if ack.ack_type == AckType::HandshakeConfirm {
                    self.handshake.receive_confirm(&ack)?;
                } else {
                    self.delivery.handle_ack(&ack)?;
                }
                FollowUps::default()
            }
        };
        Ok(followups)
    }

    /// Process incoming frames until `shutdown` is set or every sender is
    /// gone.
    pub async fn run(self, mut rx: IncomingReceiver, mut shutdown: watch::Receiver<bool>) {
        info!("router started");
        loop {
            let incoming = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                incoming = rx.recv() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            let router = self.clone();
            tokio::spawn(async move {
                let result = router.process(&incoming.inbound).await;
                match &result {
                    Ok(_) => {}
                    Err(e) if e.is_locally_recovered() => debug!(error = %e, "frame handled elsewhere"),
                    Err(e) => warn!(port = incoming.inbound.port, error = %e, "frame rejected"),
                }
                incoming.respond(verdict(&result));
                if let Ok(followups) = result {
                    if let Err(e) = followups.run(&router.ctx).await {
                        warn!(error = %e, "follow-up send failed");
                    }
                }
            });
        }
        info!("router stopped");
    }
}

/// Status byte for a handling result.
pub fn verdict<T>(result: &Result<T>) -> u8 {
    match result {
        Ok(_) => STATUS_ACCEPTED,
        Err(e) if e.is_locally_recovered() => STATUS_ACCEPTED,
        Err(Error::InvalidPin) => STATUS_INVALID_PIN,
        Err(_) => STATUS_REJECTED,
    }
}
