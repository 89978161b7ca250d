//! FIN/ACK close handshake
//!
//! Run over a cipher stream after a session's copy loops stopped. Both
//! peers exchange FIN and ACK signals so each knows no further data frame
//! of the finished session is in flight. Only then is the transport byte
//! stream known to sit on a frame boundary and fit for another session.
//!
//! The machine is a pure [`transition`] function; [`CloseHandshake::run`]
//! drives it against a reader and writer.

use super::stream::{CipherReader, CipherWriter};
use super::{Frame, FrameType, TunnelError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Close handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    /// Initiator: FIN sent, awaiting the peer's answer
    FinWait1,
    /// Initiator: FIN acknowledged, awaiting the peer's FIN
    FinWait2,
    /// Both sides sent FIN at once; ACK owed to the peer
    Closing,
    /// Initiator: final ACK sent, handshake complete
    TimeWait,
    /// Responder: peer FIN seen, ACK owed
    CloseWait,
    /// Responder: ACK sent, FIN owed
    LastAck,
    /// Own FIN and ACK sent, awaiting the peer's ACK
    Closed,
}

impl CloseState {
    /// Whether the machine stops once this state finishes its work
    pub fn is_terminal(self) -> bool {
        matches!(self, CloseState::TimeWait | CloseState::Closed)
    }
}

/// Inputs to the close machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseEvent {
    /// The handshake begins
    Start,
    /// The last requested signal reached the transport
    Sent,
    /// A FIN signal arrived
    Fin,
    /// An ACK signal arrived
    Ack,
    /// A data frame arrived
    Data,
}

/// Work requested by the close machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    SendFin,
    SendAck,
    /// Read the next signal from the peer
    Receive,
    /// Handshake complete; the transport is reusable
    Finish,
}

/// Advance the close machine by one event
///
/// Every pairing not listed is an [`TunnelError::UnexpectedFrame`]; the
/// caller must then treat the transport as misaligned.
pub fn transition(
    state: CloseState,
    event: CloseEvent,
) -> Result<(CloseState, CloseAction), TunnelError> {
    use CloseAction::*;
    use CloseEvent::*;
    use CloseState::*;

    let next = match (state, event) {
        (FinWait1, Start) => (FinWait1, SendFin),
        (FinWait1, Sent) => (FinWait1, Receive),
        (FinWait1, Fin) => (Closing, SendAck),
        (FinWait1, Ack) => (FinWait2, Receive),

        (FinWait2, Fin) => (TimeWait, SendAck),

        (TimeWait, Sent) => (TimeWait, Finish),

        (Closing, Sent) => (Closed, Receive),

        (Closed, Ack) => (Closed, Finish),

        (CloseWait, Start) => (CloseWait, SendAck),
        (CloseWait, Sent) => (LastAck, SendFin),

        (LastAck, Sent) => (Closed, Receive),

        (state, event) => {
            return Err(TunnelError::UnexpectedFrame(format!(
                "{:?} in close state {:?}",
                event, state
            )))
        }
    };
    Ok(next)
}

/// One run of the close handshake
#[derive(Debug, Clone)]
pub struct CloseHandshake {
    state: CloseState,
    trace: Vec<CloseState>,
}

impl CloseHandshake {
    /// Side whose outgoing direction ended first
    pub fn initiator() -> Self {
        Self::starting_at(CloseState::FinWait1)
    }

    /// Side that received the peer's FIN first
    pub fn responder() -> Self {
        Self::starting_at(CloseState::CloseWait)
    }

    fn starting_at(state: CloseState) -> Self {
        Self {
            state,
            trace: vec![state],
        }
    }

    pub fn state(&self) -> CloseState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn trace(&self) -> &[CloseState] {
        &self.trace
    }

    /// Feed one event and return the action to perform
    pub fn step(&mut self, event: CloseEvent) -> Result<CloseAction, TunnelError> {
        let (next, action) = transition(self.state, event)?;
        if next != self.state {
            trace!("Close state {:?} -> {:?}", self.state, next);
            self.trace.push(next);
            self.state = next;
        }
        Ok(action)
    }

    /// Drive the handshake to completion
    ///
    /// Decoded data still buffered in `reader` belongs to the finished
    /// session and is dropped. The caller bounds the run with a timeout.
    pub async fn run<R, W>(
        &mut self,
        reader: &mut CipherReader<R>,
        writer: &mut CipherWriter<W>,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let dropped = reader.discard_buffered();
        if dropped > 0 {
            debug!("Dropped {} undelivered bytes before close handshake", dropped);
        }

        let mut event = CloseEvent::Start;
        loop {
            match self.step(event)? {
                CloseAction::SendFin => {
                    writer.write_frame(&Frame::fin()).await?;
                    event = CloseEvent::Sent;
                }
                CloseAction::SendAck => {
                    writer.write_frame(&Frame::ack()).await?;
                    event = CloseEvent::Sent;
                }
                CloseAction::Receive => {
                    event = receive_signal(reader).await?;
                }
                CloseAction::Finish => {
                    debug!("Close handshake complete: {:?}", self.trace);
                    return Ok(());
                }
            }
        }
    }
}

/// Read frames until one means something to the close machine
async fn receive_signal<R>(reader: &mut CipherReader<R>) -> Result<CloseEvent, TunnelError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = reader.read_frame().await?;
        match frame.frame_type {
            FrameType::Ping => continue,
            FrameType::Data => return Ok(CloseEvent::Data),
            FrameType::Reset if frame.is_fin() => return Ok(CloseEvent::Fin),
            FrameType::Reset if frame.is_ack() => return Ok(CloseEvent::Ack),
            other => {
                return Err(TunnelError::UnexpectedFrame(format!(
                    "{:?} frame with flags {:?} during close",
                    other, frame.flags
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Cipher, Method};
    use crate::tunnel::{CipherStream, Flags};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn pair() -> (
        CipherStream<tokio::io::DuplexStream>,
        CipherStream<tokio::io::DuplexStream>,
    ) {
        let cipher = Arc::new(Cipher::from_password(Method::Aes256Gcm, "close-test").unwrap());
        let (a, b) = duplex(64 * 1024);
        (
            CipherStream::new(a, Arc::clone(&cipher), Flags::TCP),
            CipherStream::new(b, cipher, Flags::TCP),
        )
    }

    #[test]
    fn test_transition_table() {
        assert_eq!(
            transition(CloseState::FinWait1, CloseEvent::Start).unwrap(),
            (CloseState::FinWait1, CloseAction::SendFin)
        );
        assert_eq!(
            transition(CloseState::FinWait1, CloseEvent::Ack).unwrap(),
            (CloseState::FinWait2, CloseAction::Receive)
        );
        assert_eq!(
            transition(CloseState::FinWait2, CloseEvent::Fin).unwrap(),
            (CloseState::TimeWait, CloseAction::SendAck)
        );
        assert_eq!(
            transition(CloseState::Closed, CloseEvent::Ack).unwrap(),
            (CloseState::Closed, CloseAction::Finish)
        );
    }

    #[test]
    fn test_unexpected_events_are_fatal() {
        for (state, event) in [
            (CloseState::FinWait1, CloseEvent::Data),
            (CloseState::FinWait2, CloseEvent::Ack),
            (CloseState::FinWait2, CloseEvent::Data),
            (CloseState::Closed, CloseEvent::Fin),
            (CloseState::Closed, CloseEvent::Data),
            (CloseState::CloseWait, CloseEvent::Fin),
            (CloseState::LastAck, CloseEvent::Ack),
        ] {
            assert!(
                matches!(transition(state, event), Err(TunnelError::UnexpectedFrame(_))),
                "{:?} / {:?}",
                state,
                event
            );
        }
    }

    #[test]
    fn test_initiator_synthetic_events() {
        let mut machine = CloseHandshake::initiator();
        assert_eq!(machine.step(CloseEvent::Start).unwrap(), CloseAction::SendFin);
        assert_eq!(machine.step(CloseEvent::Sent).unwrap(), CloseAction::Receive);
        assert_eq!(machine.step(CloseEvent::Ack).unwrap(), CloseAction::Receive);
        assert_eq!(machine.step(CloseEvent::Fin).unwrap(), CloseAction::SendAck);
        assert_eq!(machine.step(CloseEvent::Sent).unwrap(), CloseAction::Finish);
        assert_eq!(
            machine.trace(),
            &[CloseState::FinWait1, CloseState::FinWait2, CloseState::TimeWait]
        );
        assert!(machine.state().is_terminal());
    }

    #[tokio::test]
    async fn test_initiator_against_acking_peer() {
        let (mut local, mut peer) = pair();

        let peer_task = tokio::spawn(async move {
            assert!(peer.read_frame().await.unwrap().is_fin());
            peer.write_frame(&Frame::ack()).await.unwrap();
            peer.write_frame(&Frame::fin()).await.unwrap();
            assert!(peer.read_frame().await.unwrap().is_ack());
        });

        let mut machine = CloseHandshake::initiator();
        let (reader, writer) = local.halves();
        machine.run(reader, writer).await.unwrap();
        peer_task.await.unwrap();

        assert_eq!(
            machine.trace(),
            &[CloseState::FinWait1, CloseState::FinWait2, CloseState::TimeWait]
        );
    }

    #[tokio::test]
    async fn test_responder_waits_for_final_ack() {
        let (mut local, mut peer) = pair();

        // The responder only starts after it saw the peer's FIN
        let peer_task = tokio::spawn(async move {
            assert!(peer.read_frame().await.unwrap().is_ack());
            assert!(peer.read_frame().await.unwrap().is_fin());
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            peer.write_frame(&Frame::ack()).await.unwrap();
            peer
        });

        let mut machine = CloseHandshake::responder();
        let (reader, writer) = local.halves();
        machine.run(reader, writer).await.unwrap();
        let _peer = peer_task.await.unwrap();

        assert_eq!(
            machine.trace(),
            &[CloseState::CloseWait, CloseState::LastAck, CloseState::Closed]
        );
    }

    #[tokio::test]
    async fn test_both_sides_complete() {
        let (mut a, mut b) = pair();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            assert!(matches!(b.read(&mut buf).await, Err(TunnelError::FinReceived)));
            let mut machine = CloseHandshake::responder();
            let (reader, writer) = b.halves();
            machine.run(reader, writer).await.unwrap();
            machine.trace().to_vec()
        });

        let mut machine = CloseHandshake::initiator();
        let (reader, writer) = a.halves();
        machine.run(reader, writer).await.unwrap();

        assert_eq!(
            machine.trace(),
            &[CloseState::FinWait1, CloseState::FinWait2, CloseState::TimeWait]
        );
        assert_eq!(
            responder.await.unwrap(),
            vec![CloseState::CloseWait, CloseState::LastAck, CloseState::Closed]
        );
    }

    #[tokio::test]
    async fn test_simultaneous_close() {
        let (mut a, mut b) = pair();

        let other = tokio::spawn(async move {
            let mut machine = CloseHandshake::initiator();
            let (reader, writer) = b.halves();
            machine.run(reader, writer).await.unwrap();
            machine.trace().to_vec()
        });

        let mut machine = CloseHandshake::initiator();
        let (reader, writer) = a.halves();
        machine.run(reader, writer).await.unwrap();

        let expected = vec![CloseState::FinWait1, CloseState::Closing, CloseState::Closed];
        assert_eq!(machine.trace(), expected.as_slice());
        assert_eq!(other.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_pings_are_skipped() {
        let (mut local, mut peer) = pair();

        let peer_task = tokio::spawn(async move {
            assert!(peer.read_frame().await.unwrap().is_fin());
            peer.ping().await.unwrap();
            peer.write_frame(&Frame::ack()).await.unwrap();
            peer.ping().await.unwrap();
            peer.write_frame(&Frame::fin()).await.unwrap();
            assert!(peer.read_frame().await.unwrap().is_ack());
        });

        let mut machine = CloseHandshake::initiator();
        let (reader, writer) = local.halves();
        machine.run(reader, writer).await.unwrap();
        peer_task.await.unwrap();
        assert_eq!(machine.state(), CloseState::TimeWait);
    }

    #[tokio::test]
    async fn test_data_in_fin_wait1_is_fatal() {
        let (mut local, mut peer) = pair();

        let peer_task = tokio::spawn(async move {
            assert!(peer.read_frame().await.unwrap().is_fin());
            peer.write_frame(&Frame::data(Flags::TCP, Bytes::from_static(b"late")))
                .await
                .unwrap();
            peer
        });

        let mut machine = CloseHandshake::initiator();
        let (reader, writer) = local.halves();
        let result = machine.run(reader, writer).await;
        let _peer = peer_task.await.unwrap();

        assert!(matches!(result, Err(TunnelError::UnexpectedFrame(_))));
        assert_eq!(machine.state(), CloseState::FinWait1);
    }

    #[tokio::test]
    async fn test_peer_hangup_is_an_error() {
        let (mut local, peer) = pair();
        drop(peer);

        let mut machine = CloseHandshake::initiator();
        let (reader, writer) = local.halves();
        assert!(machine.run(reader, writer).await.is_err());
    }
}
