//! Stream lifecycle (RFC 7540 Section 5.1) on the server side
//!
//! Client streams are odd. Pushed streams are even and start reserved
//! locally. A stream leaves the active set as soon as both directions
//! have ended or it is reset, and its id is remembered as closed.

use super::error::{Error, Result};
use super::flow_control::FlowController;
use super::frames::PrioritySpec;
use super::headers::HeaderList;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// 31-bit stream identifier; 0 is the connection itself
pub type StreamId = u32;

/// Closed ids kept in the table; older ones are still classified as closed
/// by id order but forget whether we reset them
pub const MAX_RETAINED_CLOSED: usize = 1024;

/// RFC 7540 stream states as seen by this endpoint
///
/// "Local" is the server. `ReservedRemote` is listed for completeness; a
/// server never enters it because clients cannot push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// We sent PUSH_PROMISE and owe the pushed response
    ReservedLocal,
    ReservedRemote,
    Open,
    /// Our response finished; request body may still arrive
    HalfClosedLocal,
    /// Request finished; response may still be sent
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Whether we may still send HEADERS or DATA
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Whether the peer may still send DATA
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// How a frame's stream id relates to what the table has seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLookup {
    /// Stream is in the active set
    Active,
    /// Stream was used and has since closed (or was skipped over)
    Closed,
    /// Stream id was never used
    Idle,
}

/// Response body waiting for send window
#[derive(Debug, Clone)]
struct PendingBody {
    data: Bytes,
    end_stream: bool,
}

/// One stream: its state, the request gathered so far and the response
/// body still to send
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    /// Recorded but not used for scheduling
    priority: PrioritySpec,
    /// Request pseudo-headers and fields, once the block is decoded
    headers: Option<HeaderList>,
    /// Request trailers
    trailers: Option<HeaderList>,
    /// Request body received so far
    body: BytesMut,
    /// Response body not yet sent
    pending: Option<PendingBody>,
    /// Bytes of response body already sent
    send_offset: usize,
    /// Stream the PUSH_PROMISE was sent on, for pushed streams
    associated: Option<StreamId>,
}

impl H2Stream {
    /// Idle stream with default priority
    pub fn new(id: StreamId) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            priority: PrioritySpec::default(),
            headers: None,
            trailers: None,
            body: BytesMut::new(),
            pending: None,
            send_offset: 0,
            associated: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn priority(&self) -> &PrioritySpec {
        &self.priority
    }

    /// Record a PRIORITY or HEADERS priority block
    ///
    /// A stream cannot depend on itself (RFC 7540 Section 5.3.1).
    pub fn set_priority(&mut self, priority: PrioritySpec) -> Result<()> {
        if priority.stream_dependency == self.id {
            return Err(Error::Protocol(format!("stream {} depends on itself", self.id)));
        }
        self.priority = priority;
        Ok(())
    }

    /// Whether this stream was reserved by a PUSH_PROMISE
    pub fn is_pushed(&self) -> bool {
        self.associated.is_some()
    }

    /// Stream the push was promised on
    pub fn associated_stream(&self) -> Option<StreamId> {
        self.associated
    }

    /// Get decoded request headers
    pub fn headers(&self) -> Option<&HeaderList> {
        self.headers.as_ref()
    }

    /// Store decoded request headers
    pub fn set_headers(&mut self, headers: HeaderList) {
        self.headers = Some(headers);
    }

    /// Get request trailers
    pub fn trailers(&self) -> Option<&HeaderList> {
        self.trailers.as_ref()
    }

    /// Store request trailers
    pub fn set_trailers(&mut self, trailers: HeaderList) {
        self.trailers = Some(trailers);
    }

    /// Request body received so far
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take body (consumes the body data)
    pub fn take_body(&mut self) -> Bytes {
        std::mem::take(&mut self.body).freeze()
    }

    /// Bytes of response body sent so far
    pub fn send_offset(&self) -> usize {
        self.send_offset
    }

    /// Process incoming HEADERS
    ///
    /// A second block on an open stream is a trailer block and must end
    /// the stream.
    pub fn receive_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                if !end_stream {
                    return Err(Error::Protocol(format!(
                        "trailers on stream {} without END_STREAM",
                        self.id
                    )));
                }
                self.end_remote();
            }
            StreamState::HalfClosedRemote | StreamState::Closed => {
                return Err(Error::StreamClosed(self.id));
            }
            StreamState::ReservedLocal | StreamState::ReservedRemote => {
                return Err(Error::Protocol(format!(
                    "Cannot receive HEADERS in state {:?}",
                    self.state
                )));
            }
        }
        Ok(())
    }

    /// Process incoming DATA
    pub fn receive_data(&mut self, data: &[u8], end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }

        self.body.extend_from_slice(data);

        if end_stream {
            self.end_remote();
        }
        Ok(())
    }

    fn end_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    fn end_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// Prepare to send HEADERS
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => self.state = StreamState::Open,
            StreamState::ReservedLocal => self.state = StreamState::HalfClosedRemote,
            StreamState::Open | StreamState::HalfClosedRemote => {}
            _ => {
                return Err(Error::Protocol(format!(
                    "Cannot send HEADERS in state {:?}",
                    self.state
                )));
            }
        }

        if end_stream {
            self.end_local();
        }
        Ok(())
    }

    /// Record `data_len` body bytes going out
    pub fn send_data(&mut self, data_len: usize, end_stream: bool) -> Result<()> {
        if !self.state.can_send() {
            return Err(Error::StreamClosed(self.id));
        }

        self.send_offset += data_len;
        if end_stream {
            self.end_local();
        }
        Ok(())
    }

    /// Queue a response body to be sent as window allows
    pub fn queue_body(&mut self, data: Bytes, end_stream: bool) {
        self.pending = Some(PendingBody { data, end_stream });
    }

    /// Whether queued body bytes (or a queued END_STREAM) remain
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes of body still queued
    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.data.len())
    }

    /// Take up to `max` queued bytes
    ///
    /// Returns the chunk and whether it is the last one of a body that
    /// ends the stream.
    pub fn next_chunk(&mut self, max: usize) -> Option<(Bytes, bool)> {
        let pending = self.pending.as_mut()?;
        if pending.data.len() <= max {
            let last = self.pending.take()?;
            return Some((last.data, last.end_stream));
        }
        Some((pending.data.split_to(max), false))
    }

    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Reset the stream, dropping anything queued for it
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
        self.pending = None;
        self.body.clear();
    }
}

/// Every stream of one connection
///
/// Owns every live stream of a connection plus the ids of the ones that
/// have closed. Window bookkeeping is delegated to the [`FlowController`]
/// passed in on open and close.
#[derive(Debug)]
pub struct StreamTable {
    /// Active streams, ordered by id
    streams: BTreeMap<StreamId, H2Stream>,
    /// Ids retired from the active set, flagged when we reset them
    closed: BTreeMap<StreamId, bool>,
    /// Highest client-initiated id seen
    last_client_stream_id: StreamId,
    /// Next even id for a pushed stream
    next_push_stream_id: StreamId,
    /// Our SETTINGS_MAX_CONCURRENT_STREAMS, limiting the client
    max_concurrent_streams: Option<u32>,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS, limiting our pushes
    peer_max_concurrent_streams: Option<u32>,
}

impl StreamTable {
    /// Create a table enforcing `max_concurrent_streams` on the client
    pub fn new(max_concurrent_streams: Option<u32>) -> Self {
        StreamTable {
            streams: BTreeMap::new(),
            closed: BTreeMap::new(),
            last_client_stream_id: 0,
            next_push_stream_id: 2,
            max_concurrent_streams,
            peer_max_concurrent_streams: None,
        }
    }

    /// Update the limit on streams we may push
    pub fn set_peer_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.peer_max_concurrent_streams = max;
    }

    /// Highest client stream id processed so far
    pub fn last_client_stream_id(&self) -> StreamId {
        self.last_client_stream_id
    }

    /// Classify a stream id
    pub fn lookup(&self, stream_id: StreamId) -> StreamLookup {
        if self.streams.contains_key(&stream_id) {
            StreamLookup::Active
        } else if self.closed.contains_key(&stream_id) {
            StreamLookup::Closed
        } else if stream_id % 2 == 1 && stream_id <= self.last_client_stream_id {
            StreamLookup::Closed
        } else if stream_id % 2 == 0 && stream_id < self.next_push_stream_id {
            StreamLookup::Closed
        } else {
            StreamLookup::Idle
        }
    }

    /// Open a client-initiated stream
    ///
    /// Ids must be odd and strictly increasing. A stream beyond our
    /// concurrency limit is recorded as closed and refused.
    pub fn open_remote(
        &mut self,
        stream_id: StreamId,
        flow: &mut FlowController,
    ) -> Result<&mut H2Stream> {
        if stream_id % 2 == 0 {
            return Err(Error::Protocol(format!(
                "client opened even stream {}",
                stream_id
            )));
        }
        if stream_id <= self.last_client_stream_id {
            return Err(Error::Protocol(format!(
                "stream {} is not above the last client stream {}",
                stream_id, self.last_client_stream_id
            )));
        }
        self.last_client_stream_id = stream_id;

        if let Some(max) = self.max_concurrent_streams {
            if self.remote_active_count() >= max as usize {
                self.retire(stream_id, false);
                return Err(Error::RefusedStream(stream_id));
            }
        }

        flow.register_stream(stream_id);
        Ok(self
            .streams
            .entry(stream_id)
            .or_insert_with(|| H2Stream::new(stream_id)))
    }

    /// Reserve an even stream for a PUSH_PROMISE sent on `associated`
    pub fn reserve_push(
        &mut self,
        associated: StreamId,
        flow: &mut FlowController,
    ) -> Result<StreamId> {
        if let Some(max) = self.peer_max_concurrent_streams {
            if self.pushed_active_count() >= max as usize {
                return Err(Error::RefusedStream(self.next_push_stream_id));
            }
        }
        let stream_id = self.next_push_stream_id;
        if stream_id > super::MAX_STREAM_ID - 1 {
            return Err(Error::Internal("push stream ids exhausted".to_string()));
        }
        self.next_push_stream_id += 2;

        let mut stream = H2Stream::new(stream_id);
        stream.state = StreamState::ReservedLocal;
        stream.associated = Some(associated);
        self.streams.insert(stream_id, stream);
        flow.register_stream(stream_id);
        Ok(stream_id)
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Move a stream to the closed set
    pub fn close(&mut self, stream_id: StreamId, flow: &mut FlowController) -> Option<H2Stream> {
        let mut stream = self.streams.remove(&stream_id)?;
        stream.close();
        self.retire(stream_id, false);
        flow.unregister_stream(stream_id);
        Some(stream)
    }

    /// Close a stream we reset, active or not
    ///
    /// Frames the peer sent before seeing our RST_STREAM are then dropped
    /// instead of treated as errors.
    pub fn reset(&mut self, stream_id: StreamId, flow: &mut FlowController) -> Option<H2Stream> {
        let stream = self.streams.remove(&stream_id).map(|mut stream| {
            stream.reset();
            flow.unregister_stream(stream_id);
            stream
        });
        self.retire(stream_id, true);
        stream
    }

    /// Whether `stream_id` is a closed stream we reset
    pub fn was_reset(&self, stream_id: StreamId) -> bool {
        self.closed.get(&stream_id).copied().unwrap_or(false)
    }

    fn retire(&mut self, stream_id: StreamId, reset: bool) {
        let flag = self.closed.entry(stream_id).or_insert(false);
        *flag |= reset;
        while self.closed.len() > MAX_RETAINED_CLOSED {
            self.closed.pop_first();
        }
    }

    /// Close the stream if both directions have ended
    pub fn close_if_done(&mut self, stream_id: StreamId, flow: &mut FlowController) -> bool {
        let done = self
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.state().is_closed());
        if done {
            self.close(stream_id, flow);
        }
        done
    }

    /// Close pushed streams above `last_stream_id`, returning their ids
    pub fn close_pushed_above(
        &mut self,
        last_stream_id: StreamId,
        flow: &mut FlowController,
    ) -> Vec<StreamId> {
        let ids: Vec<StreamId> = self
            .streams
            .keys()
            .copied()
            .filter(|id| id % 2 == 0 && *id > last_stream_id)
            .collect();
        for id in &ids {
            self.close(*id, flow);
        }
        ids
    }

    /// Close every stream, returning their ids
    pub fn close_all(&mut self, flow: &mut FlowController) -> Vec<StreamId> {
        let ids = self.stream_ids();
        for id in &ids {
            self.close(*id, flow);
        }
        ids
    }

    /// Streams in the active set, pushed ones included
    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    fn remote_active_count(&self) -> usize {
        self.streams.keys().filter(|id| *id % 2 == 1).count()
    }

    fn pushed_active_count(&self) -> usize {
        self.streams.keys().filter(|id| *id % 2 == 0).count()
    }

    /// All active stream IDs, in ascending order
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Active streams with queued body, in ascending id order
    pub fn pending_ids(&self) -> Vec<StreamId> {
        self.streams
            .values()
            .filter(|s| s.has_pending())
            .map(|s| s.id())
            .collect()
    }

    /// Number of ids in the closed set
    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::DEFAULT_INITIAL_WINDOW_SIZE;

    fn flow() -> FlowController {
        FlowController::new(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    #[test]
    fn test_stream_state_transitions() {
        let mut stream = H2Stream::new(1);
        assert_eq!(stream.state(), StreamState::Idle);

        stream.receive_headers(false).unwrap();
        assert_eq!(stream.state(), StreamState::Open);

        stream.receive_data(b"body", true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert_eq!(stream.body(), b"body");

        stream.send_headers(false).unwrap();
        stream.send_data(100, true).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(stream.send_offset(), 100);
    }

    #[test]
    fn test_data_after_remote_end_is_stream_closed() {
        let mut stream = H2Stream::new(1);
        stream.receive_headers(true).unwrap();
        assert!(matches!(
            stream.receive_data(b"late", false),
            Err(Error::StreamClosed(1))
        ));
    }

    #[test]
    fn test_trailers_must_end_stream() {
        let mut stream = H2Stream::new(1);
        stream.receive_headers(false).unwrap();
        assert!(stream.receive_headers(false).is_err());
        stream.receive_headers(true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut stream = H2Stream::new(3);
        assert!(stream.set_priority(PrioritySpec::new(3, false, 16)).is_err());
        stream.set_priority(PrioritySpec::new(1, true, 256)).unwrap();
        assert_eq!(stream.priority().weight, 256);
    }

    #[test]
    fn test_next_chunk() {
        let mut stream = H2Stream::new(1);
        stream.queue_body(Bytes::from(vec![0u8; 10]), true);

        let (chunk, last) = stream.next_chunk(4).unwrap();
        assert_eq!((chunk.len(), last), (4, false));
        assert_eq!(stream.pending_len(), 6);

        let (chunk, last) = stream.next_chunk(100).unwrap();
        assert_eq!((chunk.len(), last), (6, true));
        assert!(!stream.has_pending());
        assert!(stream.next_chunk(100).is_none());
    }

    #[test]
    fn test_open_remote_ids_increase() {
        let mut table = StreamTable::new(None);
        let mut flow = flow();

        table.open_remote(1, &mut flow).unwrap();
        table.open_remote(5, &mut flow).unwrap();
        assert!(flow.has_stream(5));

        // 3 was skipped and counts as closed
        assert_eq!(table.lookup(3), StreamLookup::Closed);
        assert!(table.open_remote(3, &mut flow).is_err());
        assert!(table.open_remote(4, &mut flow).is_err());
        assert_eq!(table.lookup(7), StreamLookup::Idle);
        assert_eq!(table.last_client_stream_id(), 5);
    }

    #[test]
    fn test_concurrency_limit_refuses() {
        let mut table = StreamTable::new(Some(1));
        let mut flow = flow();

        table.open_remote(1, &mut flow).unwrap();
        assert!(matches!(
            table.open_remote(3, &mut flow),
            Err(Error::RefusedStream(3))
        ));
        assert_eq!(table.lookup(3), StreamLookup::Closed);
        assert!(!flow.has_stream(3));

        table.close(1, &mut flow);
        table.open_remote(5, &mut flow).unwrap();
    }

    #[test]
    fn test_close_moves_to_closed_set() {
        let mut table = StreamTable::new(None);
        let mut flow = flow();

        table.open_remote(1, &mut flow).unwrap();
        assert_eq!(table.lookup(1), StreamLookup::Active);

        table.close(1, &mut flow);
        assert_eq!(table.lookup(1), StreamLookup::Closed);
        assert!(!flow.has_stream(1));
        assert_eq!(table.active_count(), 0);
        assert_eq!(table.closed_count(), 1);
        assert!(!table.was_reset(1));
    }

    #[test]
    fn test_closed_set_is_bounded() {
        let mut table = StreamTable::new(None);
        let mut flow = flow();

        let ids: Vec<StreamId> = (0..MAX_RETAINED_CLOSED as u32 + 100).map(|i| 2 * i + 1).collect();
        for id in &ids {
            table.open_remote(*id, &mut flow).unwrap();
            let stream = table.reset(*id, &mut flow).unwrap();
            assert_eq!(stream.state(), StreamState::Closed);
        }

        assert_eq!(table.closed_count(), MAX_RETAINED_CLOSED);
        assert_eq!(table.active_count(), 0);
        // Dropped from the set, still closed by id order
        assert_eq!(table.lookup(1), StreamLookup::Closed);
        assert!(!table.was_reset(1));
        assert!(table.was_reset(*ids.last().unwrap()));
    }

    #[test]
    fn test_reset_refused_stream() {
        let mut table = StreamTable::new(Some(1));
        let mut flow = flow();

        table.open_remote(1, &mut flow).unwrap();
        assert!(table.open_remote(3, &mut flow).is_err());
        assert!(!table.was_reset(3));
        assert!(table.reset(3, &mut flow).is_none());
        assert!(table.was_reset(3));
        assert_eq!(table.lookup(1), StreamLookup::Active);
    }

    #[test]
    fn test_push_reservation() {
        let mut table = StreamTable::new(None);
        let mut flow = flow();
        table.open_remote(1, &mut flow).unwrap();

        let promised = table.reserve_push(1, &mut flow).unwrap();
        assert_eq!(promised, 2);
        let stream = table.get(2).unwrap();
        assert_eq!(stream.state(), StreamState::ReservedLocal);
        assert_eq!(stream.associated_stream(), Some(1));
        assert_eq!(table.reserve_push(1, &mut flow).unwrap(), 4);

        assert_eq!(table.close_pushed_above(2, &mut flow), vec![4]);
        assert_eq!(table.lookup(4), StreamLookup::Closed);

        table.set_peer_max_concurrent_streams(Some(1));
        assert!(table.reserve_push(1, &mut flow).is_err());
    }
}
