//! Credit-based flow control (RFC 7540 Sections 5.2 and 6.9)
//!
//! [`FlowController`] holds both directions for the connection and for
//! every open stream. Send windows come from the peer's settings and
//! WINDOW_UPDATEs; receive windows from ours and are replenished as DATA
//! is consumed. Only DATA payloads, padding included, are charged.

use super::error::{Error, Result};
use super::stream::StreamId;
use super::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};
use std::collections::HashMap;

/// One window in one direction
///
/// Signed: a SETTINGS shrink can leave the send side below zero.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    current_size: i64,
}

impl FlowControlWindow {
    /// 65,535 octets
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Bytes that may be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    pub fn can_send(&self, amount: usize) -> bool {
        self.current_size >= amount as i64
    }

    /// Credit a WINDOW_UPDATE, returning the new size
    ///
    /// Zero increments are a PROTOCOL_ERROR; growing past 2^31-1 is a
    /// FLOW_CONTROL_ERROR.
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol(
                "Window update increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;

        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Charge sent or received bytes
    pub fn decrease(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Apply a change of SETTINGS_INITIAL_WINDOW_SIZE
    ///
    /// The current size moves by the same delta as the initial size
    /// (RFC 7540 Section 6.9.2) and may become negative.
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        self.current_size = self.shifted_size(new_initial_size)?;
        self.initial_size = new_initial_size;
        Ok(())
    }

    fn shifted_size(&self, new_initial_size: u32) -> Result<i64> {
        let new_current = self.current_size + new_initial_size as i64 - self.initial_size as i64;
        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }
        Ok(new_current)
    }

    /// Increment needed to refill the window, once it has dropped below
    /// half of its initial size
    fn replenish_increment(&self) -> Option<u32> {
        let initial_size = self.initial_size as i64;
        if self.current_size < initial_size / 2 {
            Some((initial_size - self.current_size) as u32)
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Which window a WINDOW_UPDATE or replenish applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowTarget {
    /// Stream 0
    Connection,
    /// A single stream
    Stream(StreamId),
}

impl WindowTarget {
    /// Target for the stream id carried by a WINDOW_UPDATE frame
    pub fn from_stream_id(stream_id: StreamId) -> Self {
        if stream_id == 0 {
            WindowTarget::Connection
        } else {
            WindowTarget::Stream(stream_id)
        }
    }

    /// Stream id to put on the wire
    pub fn stream_id(&self) -> StreamId {
        match self {
            WindowTarget::Connection => 0,
            WindowTarget::Stream(id) => *id,
        }
    }
}

/// Stream-level flow control
///
/// Manages flow control for an individual stream
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    /// Send window (outbound data, granted by the peer)
    send_window: FlowControlWindow,
    /// Receive window (inbound data, granted by us)
    recv_window: FlowControlWindow,
}

impl StreamFlowControl {
    /// Create with specified initial window sizes
    pub fn with_initial_sizes(send_size: u32, recv_size: u32) -> Self {
        StreamFlowControl {
            send_window: FlowControlWindow::with_initial_size(send_size),
            recv_window: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    /// Get send window
    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    /// Get receive window
    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }
}

/// Session and per-stream flow-control accounting for one connection
///
/// Pure bookkeeping: nothing here performs I/O. The connection engine
/// turns the increments it returns into WINDOW_UPDATE frames.
#[derive(Debug)]
pub struct FlowController {
    /// Session send window
    send_window: FlowControlWindow,
    /// Session receive window
    recv_window: FlowControlWindow,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE, used for new streams' send windows
    stream_send_initial: u32,
    /// Our SETTINGS_INITIAL_WINDOW_SIZE, used for new streams' recv windows
    stream_recv_initial: u32,
    streams: HashMap<StreamId, StreamFlowControl>,
}

impl FlowController {
    /// Create a controller for a fresh connection
    ///
    /// `local_stream_window` is the INITIAL_WINDOW_SIZE this side advertises.
    pub fn new(local_stream_window: u32) -> Self {
        FlowController {
            send_window: FlowControlWindow::new(),
            recv_window: FlowControlWindow::new(),
            stream_send_initial: DEFAULT_INITIAL_WINDOW_SIZE,
            stream_recv_initial: local_stream_window,
            streams: HashMap::new(),
        }
    }

    /// Grow the session receive window to `target`
    ///
    /// Only stream 0 WINDOW_UPDATE can do this, so the returned increment
    /// must be sent to the peer.
    pub fn expand_connection_window(&mut self, target: u32) -> Result<Option<u32>> {
        let target = target.min(MAX_WINDOW_SIZE);
        let current = self.recv_window.initial_size();
        if target <= current {
            return Ok(None);
        }
        let increment = target - current;
        self.recv_window.increase(increment)?;
        self.recv_window.initial_size = target;
        Ok(Some(increment))
    }

    /// Start tracking windows for a stream
    pub fn register_stream(&mut self, stream_id: StreamId) {
        self.streams.entry(stream_id).or_insert_with(|| {
            StreamFlowControl::with_initial_sizes(self.stream_send_initial, self.stream_recv_initial)
        });
    }

    /// Stop tracking a stream's windows
    pub fn unregister_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    /// Whether windows are tracked for the stream
    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Per-stream windows, if tracked
    pub fn stream(&self, stream_id: StreamId) -> Option<&StreamFlowControl> {
        self.streams.get(&stream_id)
    }

    /// Session send window
    pub fn connection_send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    /// Session receive window
    pub fn connection_recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    /// Bytes that can be sent on `stream_id` right now, bounded by both
    /// the stream and the session send windows
    pub fn sendable(&self, stream_id: StreamId) -> usize {
        match self.streams.get(&stream_id) {
            Some(stream) => stream.send_window.available().min(self.send_window.available()),
            None => 0,
        }
    }

    /// Reserve `amount` bytes of send window on the stream and the session
    ///
    /// Returns false and changes nothing if either window is too small.
    pub fn reserve_send(&mut self, stream_id: StreamId, amount: usize) -> bool {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if !stream.send_window.can_send(amount) || !self.send_window.can_send(amount) {
            return false;
        }
        stream.send_window.decrease(amount);
        self.send_window.decrease(amount);
        true
    }

    /// Apply a WINDOW_UPDATE received from the peer
    ///
    /// A zero increment is a PROTOCOL_ERROR and an overflow past 2^31-1 a
    /// FLOW_CONTROL_ERROR. Updates for untracked streams are ignored.
    pub fn credit_received(&mut self, target: WindowTarget, delta: u32) -> Result<()> {
        if delta == 0 || delta > MAX_WINDOW_SIZE {
            return Err(Error::Protocol(format!(
                "invalid WINDOW_UPDATE increment {} for {:?}",
                delta, target
            )));
        }
        match target {
            WindowTarget::Connection => {
                self.send_window.increase(delta)?;
            }
            WindowTarget::Stream(id) => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.send_window.increase(delta)?;
                }
            }
        }
        Ok(())
    }

    /// Charge an inbound DATA payload against our receive windows
    ///
    /// Fails with FLOW_CONTROL_ERROR when the peer sent more than either
    /// window allows; nothing is charged in that case. An untracked stream
    /// is charged at the session level only.
    pub fn account_receive(&mut self, stream_id: StreamId, size: usize) -> Result<()> {
        if !self.recv_window.can_send(size) {
            return Err(Error::FlowControl(format!(
                "DATA of {} bytes exceeds connection window {}",
                size,
                self.recv_window.size()
            )));
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if !stream.recv_window.can_send(size) {
                return Err(Error::FlowControl(format!(
                    "DATA of {} bytes exceeds stream {} window {}",
                    size,
                    stream_id,
                    stream.recv_window.size()
                )));
            }
            stream.recv_window.decrease(size);
        }
        self.recv_window.decrease(size);
        Ok(())
    }

    /// Refill a receive window that dropped below half its initial size
    ///
    /// Returns the WINDOW_UPDATE increment, already credited locally.
    pub fn auto_replenish(&mut self, target: WindowTarget) -> Option<u32> {
        let window = match target {
            WindowTarget::Connection => &mut self.recv_window,
            WindowTarget::Stream(id) => &mut self.streams.get_mut(&id)?.recv_window,
        };
        let increment = window.replenish_increment()?;
        window.increase(increment).ok()?;
        Some(increment)
    }

    /// Shift every stream's send window after the peer changed
    /// SETTINGS_INITIAL_WINDOW_SIZE
    ///
    /// No window changes unless every one of them stays in range.
    pub fn apply_initial_window_delta(&mut self, delta: i64) -> Result<()> {
        let new_initial = u32::try_from(self.stream_send_initial as i64 + delta)
            .ok()
            .filter(|size| *size <= MAX_WINDOW_SIZE)
            .ok_or_else(|| {
                Error::FlowControl(format!("initial window change of {} is out of range", delta))
            })?;
        for stream in self.streams.values() {
            stream.send_window.shifted_size(new_initial)?;
        }
        for stream in self.streams.values_mut() {
            stream.send_window.update_initial_size(new_initial)?;
        }
        self.stream_send_initial = new_initial;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_window_basic() {
        let window = FlowControlWindow::new();
        assert_eq!(window.size(), DEFAULT_INITIAL_WINDOW_SIZE as i64);
        assert_eq!(window.available(), DEFAULT_INITIAL_WINDOW_SIZE as usize);
    }

    #[test]
    fn test_flow_control_window_increase() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.decrease(50);
        assert_eq!(window.size(), 50);

        window.increase(100).unwrap();
        assert_eq!(window.size(), 150);

        assert!(matches!(window.increase(0), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_flow_control_window_overflow() {
        let mut window = FlowControlWindow::with_initial_size(0x7FFFFFFF);
        assert!(matches!(window.increase(1), Err(Error::FlowControl(_))));
    }

    #[test]
    fn test_flow_control_window_update_initial_size() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.decrease(50);

        window.update_initial_size(200).unwrap();
        assert_eq!(window.initial_size(), 200);
        assert_eq!(window.size(), 150);

        window.update_initial_size(10).unwrap();
        assert_eq!(window.size(), -40);
        assert_eq!(window.available(), 0);
    }

    #[test]
    fn test_reserve_send_checks_both_windows() {
        let mut flow = FlowController::new(DEFAULT_INITIAL_WINDOW_SIZE);
        flow.register_stream(1);
        flow.register_stream(3);

        assert!(flow.reserve_send(1, 60_000));
        assert_eq!(flow.connection_send_window().size(), 5_535);

        // Stream 3 has 65535 but the session only 5535
        assert!(!flow.reserve_send(3, 10_000));
        assert_eq!(flow.sendable(3), 5_535);
        assert!(flow.reserve_send(3, 5_535));
        assert_eq!(flow.sendable(3), 0);
        assert_eq!(flow.sendable(1), 0);

        assert!(!flow.reserve_send(99, 1));
    }

    #[test]
    fn test_credit_received() {
        let mut flow = FlowController::new(DEFAULT_INITIAL_WINDOW_SIZE);
        flow.register_stream(1);
        assert!(flow.reserve_send(1, 65_535));

        flow.credit_received(WindowTarget::Stream(1), 100).unwrap();
        assert_eq!(flow.sendable(1), 0);
        flow.credit_received(WindowTarget::Connection, 40).unwrap();
        assert_eq!(flow.sendable(1), 40);

        assert!(matches!(
            flow.credit_received(WindowTarget::Stream(1), 0),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            flow.credit_received(WindowTarget::Stream(1), MAX_WINDOW_SIZE),
            Err(Error::FlowControl(_))
        ));

        // Closed or unknown streams are tolerated
        flow.credit_received(WindowTarget::Stream(7), 10).unwrap();
    }

    #[test]
    fn test_account_receive_rejects_excess() {
        let mut flow = FlowController::new(DEFAULT_INITIAL_WINDOW_SIZE);
        flow.register_stream(1);

        assert!(matches!(flow.account_receive(1, 70_000), Err(Error::FlowControl(_))));
        assert_eq!(flow.connection_recv_window().size(), 65_535);

        flow.account_receive(1, 65_535).unwrap();
        assert!(flow.account_receive(1, 1).is_err());
    }

    #[test]
    fn test_auto_replenish_threshold() {
        let mut flow = FlowController::new(100);
        flow.register_stream(1);
        flow.account_receive(1, 40).unwrap();
        assert_eq!(flow.auto_replenish(WindowTarget::Stream(1)), None);

        flow.account_receive(1, 20).unwrap();
        assert_eq!(flow.auto_replenish(WindowTarget::Stream(1)), Some(60));
        assert_eq!(flow.stream(1).unwrap().recv_window().size(), 100);

        // Session window is 65535 and still above half
        assert_eq!(flow.auto_replenish(WindowTarget::Connection), None);
    }

    #[test]
    fn test_expand_connection_window() {
        let mut flow = FlowController::new(DEFAULT_INITIAL_WINDOW_SIZE);
        assert_eq!(flow.expand_connection_window(65_535).unwrap(), None);
        assert_eq!(flow.expand_connection_window(1 << 20).unwrap(), Some((1 << 20) - 65_535));
        assert_eq!(flow.connection_recv_window().size(), 1 << 20);
    }

    #[test]
    fn test_initial_window_delta_applies_to_open_streams() {
        let mut flow = FlowController::new(DEFAULT_INITIAL_WINDOW_SIZE);
        flow.register_stream(1);
        assert!(flow.reserve_send(1, 1_000));

        flow.apply_initial_window_delta(100_000 - 65_535).unwrap();
        assert_eq!(flow.stream(1).unwrap().send_window().size(), 99_000);

        flow.register_stream(3);
        assert_eq!(flow.stream(3).unwrap().send_window().size(), 100_000);
    }

    #[test]
    fn test_initial_window_delta_overflow_changes_nothing() {
        let mut flow = FlowController::new(DEFAULT_INITIAL_WINDOW_SIZE);
        flow.register_stream(1);
        flow.register_stream(3);
        flow.credit_received(WindowTarget::Stream(3), MAX_WINDOW_SIZE - 65_535)
            .unwrap();

        assert!(matches!(
            flow.apply_initial_window_delta(1),
            Err(Error::FlowControl(_))
        ));
        assert_eq!(flow.stream(1).unwrap().send_window().size(), 65_535);
        assert_eq!(
            flow.stream(3).unwrap().send_window().size(),
            MAX_WINDOW_SIZE as i64
        );

        assert!(flow.apply_initial_window_delta(-70_000).is_err());
        flow.register_stream(5);
        assert_eq!(flow.stream(5).unwrap().send_window().size(), 65_535);
    }
}
