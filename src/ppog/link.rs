//! PPoG link task: negotiation, windowed send, acknowledgment, resets.
//!
//! One task owns all window state for a BLE connection; everything else
//! talks to it through channels:
//!
//! ```text
//! PpogSink ──► outbound frames ─┐
//! PpogHandle ─► control ────────┼─► link task ─► PacketSender (GATT write)
//! GATT notifications ─► inbound ┘        │
//!                                        └─► LinkEvent channel (protocol handler)
//! ```
//!
//! A frame is pulled from the outbound channel only once the previous one
//! has been fully handed to the window, so a full window suspends senders.
//! A sender learns the outcome once the frame's last fragment is written,
//! or gets `TransportFailure` if a reset or close drops it first.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use super::packet::{next_sequence, PpogPacket, PpogVersion, DATA_HEADER_OVERHEAD};
use crate::config::{BleConfig, MAX_WINDOW};
use crate::error::{DisconnectReason, PebblewireError, Result};
use crate::transport::{LinkEvent, MessageSink};

/// Inbound events buffered between the link task and the handler.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Writes one link-layer packet to the watch.
#[async_trait]
pub trait PacketSender: Send + Sync {
    async fn send_packet(&self, packet: Bytes) -> Result<()>;
}

/// Negotiated parameters of an open link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    pub version: PpogVersion,
    /// Maximum unacknowledged fragments we may have outstanding.
    pub tx_window: u8,
    pub rx_window: u8,
}

/// Lifecycle of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Negotiating,
    Open(LinkParams),
    Closing,
    Closed(DisconnectReason),
}

/// A frame waiting for the link, with an optional delivery report.
#[derive(Debug)]
struct OutboundFrame {
    frame: Bytes,
    done: Option<oneshot::Sender<Result<()>>>,
}

fn report(done: Option<oneshot::Sender<Result<()>>>, outcome: Result<()>) {
    if let Some(done) = done {
        let _ = done.send(outcome);
    }
}

#[derive(Debug)]
enum LinkControl {
    UpdateMtu(u16),
    Close { send_reset: bool },
}

/// Control handle for a running link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PpogHandle {
    outbound: mpsc::Sender<OutboundFrame>,
    control: mpsc::Sender<LinkControl>,
    state: watch::Receiver<LinkState>,
}

impl PpogHandle {
    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Wait until negotiation finishes.
    pub async fn wait_open(&self) -> Result<LinkParams> {
        let mut state = self.state.clone();
        let seen = state
            .wait_for(|s| matches!(s, LinkState::Open(_) | LinkState::Closed(_)))
            .await
            .map(|s| (*s).clone());
        match seen {
            Ok(LinkState::Open(params)) => Ok(params),
            Ok(LinkState::Closed(reason)) => Err(PebblewireError::TransportFailure(reason)),
            _ => Err(PebblewireError::TransportFailure(self.closed_reason())),
        }
    }

    /// Wait until the link task has ended.
    pub async fn closed(&self) -> DisconnectReason {
        let mut state = self.state.clone();
        let seen = state
            .wait_for(|s| matches!(s, LinkState::Closed(_)))
            .await
            .map(|s| (*s).clone());
        match seen {
            Ok(LinkState::Closed(reason)) => reason,
            _ => self.closed_reason(),
        }
    }

    fn closed_reason(&self) -> DisconnectReason {
        match &*self.state.borrow() {
            LinkState::Closed(reason) => reason.clone(),
            _ => DisconnectReason::LinkReset,
        }
    }

    /// Send a frame and wait until its last fragment is written,
    /// suspending while the window is full.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        let (done, written) = oneshot::channel();
        let item = OutboundFrame {
            frame,
            done: Some(done),
        };
        self.outbound
            .send(item)
            .await
            .map_err(|_| PebblewireError::TransportFailure(self.closed_reason()))?;
        written
            .await
            .unwrap_or_else(|_| Err(PebblewireError::TransportFailure(self.closed_reason())))
    }

    /// Queue a frame without waiting. Delivery is not reported.
    ///
    /// Fails with [`PebblewireError::WindowExhausted`] when the link can't
    /// take it right now.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        let item = OutboundFrame { frame, done: None };
        self.outbound.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PebblewireError::WindowExhausted,
            mpsc::error::TrySendError::Closed(_) => {
                PebblewireError::TransportFailure(self.closed_reason())
            }
        })
    }

    /// Raise the MTU. Lower values are ignored.
    pub async fn update_mtu(&self, mtu: u16) {
        let _ = self.control.send(LinkControl::UpdateMtu(mtu)).await;
    }

    /// Close the link, optionally telling the watch with a reset request.
    pub async fn close(&self, send_reset: bool) -> DisconnectReason {
        let _ = self.control.send(LinkControl::Close { send_reset }).await;
        self.closed().await
    }

    /// Frame sink for the protocol handler.
    pub fn sink(&self) -> PpogSink {
        PpogSink {
            handle: self.clone(),
        }
    }
}

/// [`MessageSink`] that feeds the link's outbound channel.
#[derive(Debug, Clone)]
pub struct PpogSink {
    handle: PpogHandle,
}

#[async_trait]
impl MessageSink for PpogSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.handle.send(frame).await
    }
}

/// Start a link task over a GATT characteristic pair.
///
/// `inbound` carries raw PPoG packets written by the watch. Returns the
/// control handle and the stream of reassembled packet-stream bytes.
pub fn spawn_link(
    sender: Arc<dyn PacketSender>,
    inbound: mpsc::Receiver<Bytes>,
    mtu: u16,
    config: &BleConfig,
) -> (PpogHandle, mpsc::Receiver<LinkEvent>) {
    let (outbound_tx, outbound_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(8);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (state_tx, state_rx) = watch::channel(LinkState::Negotiating);

    let link = Link {
        sender,
        inbound,
        outbound: outbound_rx,
        outbound_open: true,
        control: control_rx,
        events: events_tx,
        state: state_tx,
        config: config.clone(),
        mtu,
        send_reset_on_close: false,
        params: None,
        tx_sequence: 0,
        rx_sequence: 0,
        queued: VecDeque::new(),
        current: None,
        inflight: VecDeque::new(),
        last_ack: None,
        ack_deadline: None,
    };
    tokio::spawn(link.run());

    let handle = PpogHandle {
        outbound: outbound_tx,
        control: control_tx,
        state: state_rx,
    };
    (handle, events_rx)
}

// ============================================================================
// Link task
// ============================================================================

struct InflightFragment {
    sequence: u8,
    data: Bytes,
    attempts: u8,
}

enum Waited {
    Packet(PpogPacket),
    TimedOut,
}

type LinkResult<T> = std::result::Result<T, DisconnectReason>;

struct Link {
    sender: Arc<dyn PacketSender>,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Receiver<OutboundFrame>,
    outbound_open: bool,
    control: mpsc::Receiver<LinkControl>,
    events: mpsc::Sender<LinkEvent>,
    state: watch::Sender<LinkState>,
    config: BleConfig,
    mtu: u16,
    send_reset_on_close: bool,

    params: Option<LinkParams>,
    tx_sequence: u8,
    rx_sequence: u8,
    /// Fragments of the current frame not yet sent.
    queued: VecDeque<Bytes>,
    /// Delivery report for the frame in `queued`.
    current: Option<oneshot::Sender<Result<()>>>,
    inflight: VecDeque<InflightFragment>,
    last_ack: Option<u8>,
    ack_deadline: Option<Instant>,
}

impl Link {
    async fn run(mut self) {
        let reason = self.drive().await;
        self.outbound.close();
        self.control.close();

        let dropped = || Err(PebblewireError::TransportFailure(reason.clone()));
        report(self.current.take(), dropped());
        while let Ok(item) = self.outbound.try_recv() {
            report(item.done, dropped());
        }

        if reason == DisconnectReason::LocalDisconnect && self.send_reset_on_close {
            self.state.send_replace(LinkState::Closing);
            let version = self.version();
            let reset = PpogPacket::ResetRequest {
                sequence: 0,
                version,
            };
            if let Err(e) = self.send_packet(&reset, version).await {
                tracing::debug!("reset on close not delivered: {}", e);
            }
        }

        tracing::debug!("PPoG link closed: {}", reason);
        self.state.send_replace(LinkState::Closed(reason.clone()));
        let _ = self.events.send(LinkEvent::Closed(reason)).await;
    }

    async fn drive(&mut self) -> DisconnectReason {
        let params = match self.negotiate_initial().await {
            Ok(params) => params,
            Err(reason) => return reason,
        };
        self.open(params);

        loop {
            if let Err(reason) = self.step().await {
                return reason;
            }
            if let Err(reason) = self.fill_window().await {
                return reason;
            }
        }
    }

    fn version(&self) -> PpogVersion {
        self.params
            .map(|p| p.version)
            .unwrap_or(PpogVersion::One)
    }

    fn open(&mut self, params: LinkParams) {
        tracing::debug!(
            "PPoG link open: version {:?}, tx window {}, rx window {}, mtu {}",
            params.version,
            params.tx_window,
            params.rx_window,
            self.mtu
        );
        self.params = Some(params);
        self.state.send_replace(LinkState::Open(params));
    }

    fn clamp_window(theirs: u8, desired: u8) -> u8 {
        theirs.min(desired).min(MAX_WINDOW).max(1)
    }

    fn params_from(&self, version: PpogVersion, rx_window: u8, tx_window: u8) -> LinkParams {
        LinkParams {
            version,
            tx_window: Self::clamp_window(tx_window, self.config.desired_tx_window),
            rx_window: Self::clamp_window(rx_window, self.config.desired_rx_window),
        }
    }

    fn max_fragment(&self) -> usize {
        (self.mtu as usize)
            .saturating_sub(DATA_HEADER_OVERHEAD)
            .max(1)
    }

    // ------------------------------------------------------------------------
    // Packet I/O
    // ------------------------------------------------------------------------

    async fn send_packet(&self, packet: &PpogPacket, version: PpogVersion) -> LinkResult<()> {
        if self.config.verbose_ppog_logging {
            tracing::trace!("PPoG tx {:?}", packet);
        }
        self.sender
            .send_packet(packet.serialize(version))
            .await
            .map_err(|e| {
                tracing::error!("PPoG write failed: {}", e);
                DisconnectReason::TransportError(e.to_string())
            })
    }

    fn handle_control(&mut self, control: Option<LinkControl>) -> LinkResult<()> {
        match control {
            Some(LinkControl::UpdateMtu(mtu)) => {
                if mtu < self.mtu {
                    tracing::warn!("ignoring MTU decrease from {} to {}", self.mtu, mtu);
                } else {
                    tracing::debug!("MTU raised to {}", mtu);
                    self.mtu = mtu;
                }
                Ok(())
            }
            Some(LinkControl::Close { send_reset }) => {
                self.send_reset_on_close = send_reset;
                Err(DisconnectReason::LocalDisconnect)
            }
            None => Err(DisconnectReason::LocalDisconnect),
        }
    }

    fn parse_inbound(&self, bytes: Option<Bytes>) -> LinkResult<Option<PpogPacket>> {
        let bytes = bytes.ok_or(DisconnectReason::RemoteClosed)?;
        match PpogPacket::parse(&bytes) {
            Ok(packet) => {
                if self.config.verbose_ppog_logging {
                    tracing::trace!("PPoG rx {:?}", packet);
                }
                Ok(Some(packet))
            }
            Err(e) => {
                tracing::warn!("dropping unparseable PPoG packet: {}", e);
                Ok(None)
            }
        }
    }

    /// Next inbound packet, or `TimedOut` once `deadline` passes.
    async fn next_packet_until(&mut self, deadline: Instant) -> LinkResult<Waited> {
        loop {
            tokio::select! {
                control = self.control.recv() => self.handle_control(control)?,
                bytes = self.inbound.recv() => {
                    if let Some(packet) = self.parse_inbound(bytes)? {
                        return Ok(Waited::Packet(packet));
                    }
                }
                _ = sleep_until(deadline) => return Ok(Waited::TimedOut),
            }
        }
    }

    async fn wait_for_reset_request(&mut self, deadline: Instant) -> LinkResult<Option<PpogVersion>> {
        loop {
            match self.next_packet_until(deadline).await? {
                Waited::Packet(PpogPacket::ResetRequest { version, .. }) => return Ok(Some(version)),
                Waited::Packet(other) => {
                    tracing::warn!("unexpected {:?} while waiting for reset request", other)
                }
                Waited::TimedOut => return Ok(None),
            }
        }
    }

    async fn wait_for_reset_complete(&mut self, deadline: Instant) -> LinkResult<Option<(u8, u8)>> {
        loop {
            match self.next_packet_until(deadline).await? {
                Waited::Packet(PpogPacket::ResetComplete {
                    rx_window,
                    tx_window,
                    ..
                }) => return Ok(Some((rx_window, tx_window))),
                Waited::Packet(other) => {
                    tracing::warn!("unexpected {:?} while waiting for reset complete", other)
                }
                Waited::TimedOut => return Ok(None),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    async fn negotiate_initial(&mut self) -> LinkResult<LinkParams> {
        tracing::debug!("waiting for PPoG reset request");
        let deadline = Instant::now() + self.config.negotiation_timeout();
        if let Some(version) = self.wait_for_reset_request(deadline).await? {
            return self
                .respond_to_reset(version)
                .await?
                .ok_or(DisconnectReason::NegotiationTimeout);
        }

        if self.config.reversed_ppog {
            tracing::debug!("no reset request from watch; sending our own");
            return self
                .request_reset(PpogVersion::One)
                .await?
                .ok_or(DisconnectReason::NegotiationTimeout);
        }

        Err(DisconnectReason::NegotiationTimeout)
    }

    /// Answer a reset request from the watch. `None` on timeout.
    async fn respond_to_reset(&mut self, version: PpogVersion) -> LinkResult<Option<LinkParams>> {
        let ours = PpogPacket::ResetComplete {
            sequence: 0,
            rx_window: self.config.desired_rx_window.min(MAX_WINDOW),
            tx_window: self.config.desired_tx_window.min(MAX_WINDOW),
        };
        self.send_packet(&ours, version).await?;

        let deadline = Instant::now() + self.config.reset_complete_timeout();
        Ok(self
            .wait_for_reset_complete(deadline)
            .await?
            // Our tx window is the watch's rx window and vice versa.
            .map(|(rx, tx)| self.params_from(version, tx, rx)))
    }

    /// Ask the watch for a reset. `None` on timeout.
    async fn request_reset(&mut self, version: PpogVersion) -> LinkResult<Option<LinkParams>> {
        let request = PpogPacket::ResetRequest {
            sequence: 0,
            version,
        };
        self.send_packet(&request, version).await?;

        let deadline = Instant::now() + self.config.reset_complete_timeout();
        let Some((rx, tx)) = self.wait_for_reset_complete(deadline).await? else {
            return Ok(None);
        };
        let echo = PpogPacket::ResetComplete {
            sequence: 0,
            rx_window: rx,
            tx_window: tx,
        };
        self.send_packet(&echo, version).await?;
        Ok(Some(self.params_from(version, rx, tx)))
    }

    /// Drop all window state and tell the handler to discard partial frames.
    async fn clear_window(&mut self) -> LinkResult<()> {
        if !self.inflight.is_empty() || !self.queued.is_empty() {
            tracing::warn!(
                "link reset drops {} in-flight and {} queued fragments",
                self.inflight.len(),
                self.queued.len()
            );
        }
        self.tx_sequence = 0;
        self.rx_sequence = 0;
        self.queued.clear();
        report(
            self.current.take(),
            Err(PebblewireError::TransportFailure(DisconnectReason::LinkReset)),
        );
        self.inflight.clear();
        self.last_ack = None;
        self.ack_deadline = None;
        self.state.send_replace(LinkState::Negotiating);
        self.events
            .send(LinkEvent::Reset)
            .await
            .map_err(|_| DisconnectReason::LocalDisconnect)
    }

    // ------------------------------------------------------------------------
    // Open link
    // ------------------------------------------------------------------------

    async fn step(&mut self) -> LinkResult<()> {
        let take_outbound = self.outbound_open && self.queued.is_empty();
        let deadline = self.ack_deadline;

        tokio::select! {
            control = self.control.recv() => self.handle_control(control),
            bytes = self.inbound.recv() => match self.parse_inbound(bytes)? {
                Some(packet) => self.handle_packet(packet).await,
                None => Ok(()),
            },
            frame = self.outbound.recv(), if take_outbound => {
                match frame {
                    Some(item) => self.enqueue_frame(item),
                    None => self.outbound_open = false,
                }
                Ok(())
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                self.on_ack_timeout().await
            }
        }
    }

    fn enqueue_frame(&mut self, item: OutboundFrame) {
        let OutboundFrame { frame, done } = item;
        if frame.is_empty() {
            report(done, Ok(()));
            return;
        }
        self.current = done;
        let chunk = self.max_fragment();
        let mut offset = 0;
        while offset < frame.len() {
            let end = (offset + chunk).min(frame.len());
            self.queued.push_back(frame.slice(offset..end));
            offset = end;
        }
    }

    /// Move queued fragments onto the wire while the window allows.
    async fn fill_window(&mut self) -> LinkResult<()> {
        let Some(params) = self.params else {
            return Ok(());
        };
        while self.inflight.len() < params.tx_window as usize {
            let Some(data) = self.queued.pop_front() else {
                break;
            };
            let sequence = self.tx_sequence;
            self.tx_sequence = next_sequence(sequence);
            let packet = PpogPacket::Data {
                sequence,
                data: data.clone(),
            };
            self.send_packet(&packet, params.version).await?;
            if self.inflight.is_empty() {
                self.ack_deadline = Some(Instant::now() + self.config.ack_timeout());
            }
            self.inflight.push_back(InflightFragment {
                sequence,
                data,
                attempts: 0,
            });
            if self.queued.is_empty() {
                report(self.current.take(), Ok(()));
            }
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: PpogPacket) -> LinkResult<()> {
        let version = self.version();
        match packet {
            PpogPacket::Ack { sequence } => self.on_ack(sequence).await,
            PpogPacket::Data { sequence, data } => {
                if sequence != self.rx_sequence {
                    tracing::warn!(
                        "data out of sequence (got {}, expected {}); resending last ack",
                        sequence,
                        self.rx_sequence
                    );
                    if let Some(last) = self.last_ack {
                        self.send_packet(&PpogPacket::Ack { sequence: last }, version)
                            .await?;
                    }
                    return Ok(());
                }
                self.events
                    .send(LinkEvent::Data(data))
                    .await
                    .map_err(|_| DisconnectReason::LocalDisconnect)?;
                self.rx_sequence = next_sequence(sequence);
                self.last_ack = Some(sequence);
                self.send_packet(&PpogPacket::Ack { sequence }, version)
                    .await
            }
            PpogPacket::ResetRequest { version, .. } => {
                tracing::info!("watch requested PPoG reset");
                self.clear_window().await?;
                match self.respond_to_reset(version).await? {
                    Some(params) => {
                        self.open(params);
                        Ok(())
                    }
                    None => Err(DisconnectReason::LinkReset),
                }
            }
            PpogPacket::ResetComplete { .. } => {
                tracing::warn!("ignoring unsolicited reset complete");
                Ok(())
            }
        }
    }

    async fn on_ack(&mut self, sequence: u8) -> LinkResult<()> {
        if !self.inflight.iter().any(|f| f.sequence == sequence) {
            tracing::warn!("duplicate ack {}; resending in-flight fragments", sequence);
            return self.resend_inflight().await;
        }
        // Cumulative: everything up to and including `sequence` is delivered.
        while let Some(fragment) = self.inflight.pop_front() {
            if fragment.sequence == sequence {
                break;
            }
        }
        self.ack_deadline = if self.inflight.is_empty() {
            None
        } else {
            Some(Instant::now() + self.config.ack_timeout())
        };
        Ok(())
    }

    async fn on_ack_timeout(&mut self) -> LinkResult<()> {
        tracing::debug!("ack timeout with {} fragments in flight", self.inflight.len());
        self.resend_inflight().await
    }

    /// Retransmit every in-flight fragment, escalating to a link reset once
    /// a fragment has used up its retries.
    async fn resend_inflight(&mut self) -> LinkResult<()> {
        if self.inflight.is_empty() {
            return Ok(());
        }
        let max_retries = self.config.max_retries;
        if self.inflight.iter().any(|f| f.attempts >= max_retries) {
            return self.escalate_reset().await;
        }

        let version = self.version();
        for i in 0..self.inflight.len() {
            self.inflight[i].attempts += 1;
            let packet = PpogPacket::Data {
                sequence: self.inflight[i].sequence,
                data: self.inflight[i].data.clone(),
            };
            self.send_packet(&packet, version).await?;
        }
        self.ack_deadline = Some(Instant::now() + self.config.ack_timeout());
        Ok(())
    }

    async fn escalate_reset(&mut self) -> LinkResult<()> {
        tracing::warn!("fragment retries exhausted; resetting link");
        let version = self.version();
        self.clear_window().await?;
        match self.request_reset(version).await? {
            Some(params) => {
                self.open(params);
                Ok(())
            }
            None => Err(DisconnectReason::RetriesExhausted),
        }
    }
}
