pub mod fragment;
pub mod header;

pub use fragment::Fragment;
pub use header::{AppControl, FunctionCode, Iin};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, ProtocolError, Result, TimeoutKind};
use crate::objects::{Item, PrefixCode, RangeSpecifier, Size};
use crate::transport::TransportFunction;

const SEQ_MODULUS: u8 = 16;

fn next_app_seq(seq: u8) -> u8 {
    seq.wrapping_add(1) % SEQ_MODULUS
}

struct ConfirmWaiter {
    seq: u8,
    uns: bool,
    tx: oneshot::Sender<()>,
}

/// Pending-confirmation monitor. A sender registers interest before emitting
/// a CON fragment; the matching CONFIRM releases exactly one waiter.
#[derive(Default)]
pub struct ConfirmMonitor {
    pending: Mutex<Vec<ConfirmWaiter>>,
}

impl ConfirmMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&self, seq: u8, uns: bool) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push(ConfirmWaiter { seq, uns, tx });
        rx
    }

    pub fn complete(&self, seq: u8, uns: bool) -> bool {
        let mut pending = self.pending.lock();
        if let Some(position) = pending
            .iter()
            .position(|waiter| waiter.seq == seq && waiter.uns == uns)
        {
            let waiter = pending.remove(position);
            let _ = waiter.tx.send(());
            true
        } else {
            false
        }
    }

    /// Drop every waiter; their receivers resolve with an error.
    pub fn fail_all(&self) {
        self.pending.lock().clear();
    }
}

/// Fragment assembly and sequencing on top of the transport function.
pub struct ApplicationLayer {
    transport: Arc<TransportFunction>,
    confirm: Arc<ConfirmMonitor>,
    confirm_timeout: Duration,
    on_master: bool,
    solicited_seq: Mutex<u8>,
    unsolicited_seq: Mutex<u8>,
    /// Serializes whole-message sends so fragments of two messages cannot
    /// interleave on the transport.
    send_lock: tokio::sync::Mutex<()>,
}

impl ApplicationLayer {
    pub fn new(
        transport: Arc<TransportFunction>,
        confirm: Arc<ConfirmMonitor>,
        confirm_timeout: Duration,
        on_master: bool,
    ) -> Self {
        Self {
            transport,
            confirm,
            confirm_timeout,
            on_master,
            solicited_seq: Mutex::new(0),
            unsolicited_seq: Mutex::new(0),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &Arc<TransportFunction> {
        &self.transport
    }

    pub fn is_on_master(&self) -> bool {
        self.on_master
    }

    pub fn next_solicited_sequence(&self) -> u8 {
        let mut seq = self.solicited_seq.lock();
        let value = *seq;
        *seq = next_app_seq(value);
        value
    }

    pub fn next_unsolicited_sequence(&self) -> u8 {
        let mut seq = self.unsolicited_seq.lock();
        let value = *seq;
        *seq = next_app_seq(value);
        value
    }

    /// Send a request message. Returns the sequence of the last fragment.
    pub async fn send_request(
        &self,
        function: FunctionCode,
        items: Vec<Item>,
        con: bool,
    ) -> Result<u8> {
        self.send_message(function, None, items, con, false).await
    }

    /// Send a request with a caller-allocated first sequence, so the caller
    /// can register response matching before any byte leaves.
    pub async fn send_request_with_seq(
        &self,
        function: FunctionCode,
        items: Vec<Item>,
        con: bool,
        seq: u8,
    ) -> Result<u8> {
        self.send_message_with_seq(function, None, items, con, false, Some(seq))
            .await
    }

    /// Send a solicited or unsolicited response. Responses echo the request
    /// sequence; pass `reply_seq` for solicited responses.
    pub async fn send_response(
        &self,
        function: FunctionCode,
        iin: Iin,
        items: Vec<Item>,
        con: bool,
        reply_seq: Option<u8>,
    ) -> Result<u8> {
        let uns = function == FunctionCode::UnsolicitedResponse;
        self.send_message_with_seq(function, Some(iin), items, con, uns, reply_seq)
            .await
    }

    pub async fn send_confirm(&self, seq: u8, uns: bool) -> Result<()> {
        let fragment = Fragment::confirm(seq, uns);
        let bytes = fragment.serialize().map_err(Error::Protocol)?;
        self.transport.send(&bytes).await
    }

    async fn send_message(
        &self,
        function: FunctionCode,
        iin: Option<Iin>,
        items: Vec<Item>,
        con: bool,
        uns: bool,
    ) -> Result<u8> {
        self.send_message_with_seq(function, iin, items, con, uns, None)
            .await
    }

    async fn send_message_with_seq(
        &self,
        function: FunctionCode,
        iin: Option<Iin>,
        items: Vec<Item>,
        con: bool,
        uns: bool,
        first_seq: Option<u8>,
    ) -> Result<u8> {
        let _guard = self.send_lock.lock().await;
        let limit = self
            .transport
            .max_fragment_size()
            .saturating_sub(Fragment::header_len(function));
        let needs_values = function.needs_values();
        let batches = pack_items(items, limit, needs_values)?;
        let total = batches.len();
        let mut seq = match first_seq {
            Some(seq) => seq,
            None if uns => self.next_unsolicited_sequence(),
            None => self.next_solicited_sequence(),
        };
        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 {
                // Continuation fragments carry consecutive sequences.
                seq = next_app_seq(seq);
            }
            let control = AppControl {
                fir: index == 0,
                fin: index == total - 1,
                con,
                uns,
                seq,
            };
            let fragment = Fragment {
                control,
                function,
                iin,
                items: batch,
            };
            let waiter = con.then(|| self.confirm.expect(seq, uns));
            let bytes = fragment.serialize().map_err(Error::Protocol)?;
            self.transport.send(&bytes).await?;
            if let Some(rx) = waiter {
                match timeout(self.confirm_timeout, rx).await {
                    Ok(Ok(())) => {}
                    _ => return Err(Error::Timeout(TimeoutKind::Confirm, self.confirm_timeout)),
                }
            }
        }
        Ok(seq)
    }

    /// Receive one complete application message. CONFIRM fragments release
    /// their waiter and are not surfaced; CON-flagged responses are confirmed
    /// back to the peer automatically.
    pub async fn receive(&self) -> Result<Fragment> {
        let mut assembled: Option<(Fragment, u8)> = None;
        loop {
            let bytes = self.transport.receive().await?;
            let fragment = Fragment::parse(bytes).map_err(Error::Protocol)?;

            if fragment.function == FunctionCode::Confirm {
                let matched = self
                    .confirm
                    .complete(fragment.control.seq, fragment.control.uns);
                debug!(
                    seq = fragment.control.seq,
                    uns = fragment.control.uns,
                    matched,
                    "confirm received"
                );
                continue;
            }

            if fragment.control.con && fragment.function.is_response() {
                self.send_confirm(fragment.control.seq, fragment.control.uns)
                    .await?;
            }

            let control = fragment.control;
            let message = match assembled.take() {
                None => {
                    if !control.fir {
                        return Err(ProtocolError::UnexpectedFragment.into());
                    }
                    fragment
                }
                Some((mut message, expected_seq)) => {
                    if control.fir {
                        // A new message preempts the half-assembled one.
                        warn!("FIR mid-message; discarding partial application message");
                        fragment
                    } else if control.seq != expected_seq
                        || fragment.function != message.function
                    {
                        return Err(ProtocolError::UnexpectedFragment.into());
                    } else {
                        message.items.extend(fragment.items);
                        message.iin = match (message.iin, fragment.iin) {
                            (Some(a), Some(b)) => Some(a.union(b)),
                            (a, b) => a.or(b),
                        };
                        message.control.fin = control.fin;
                        message.control.con = control.con;
                        message
                    }
                }
            };

            if message.control.fin {
                self.check_iin(&message)?;
                return Ok(message);
            }
            let expected = next_app_seq(control.seq);
            assembled = Some((message, expected));
        }
    }

    fn check_iin(&self, message: &Fragment) -> Result<()> {
        let Some(iin) = message.iin else {
            return Ok(());
        };
        if iin.is_set(Iin::NO_FUNC_CODE_SUPPORT) {
            warn!("peer reports NO_FUNC_CODE_SUPPORT; accepting response");
        }
        if iin.is_set(Iin::OBJECT_UNKNOWN) {
            return Err(ProtocolError::ObjectUnknown.into());
        }
        if iin.is_set(Iin::PARAMETER_ERROR) {
            return Err(ProtocolError::ParameterError.into());
        }
        Ok(())
    }
}

/// Pack items into fragment-sized batches, splitting oversize items at
/// instance boundaries where the encoding allows it.
fn pack_items(items: Vec<Item>, limit: usize, needs_values: bool) -> Result<Vec<Vec<Item>>> {
    if limit < 16 {
        return Err(Error::Config(format!(
            "fragment payload limit {limit} too small"
        )));
    }
    let mut batches: Vec<Vec<Item>> = Vec::new();
    let mut current: Vec<Item> = Vec::new();
    let mut current_len = 0usize;

    let place = |item: Item,
                     len: usize,
                     batches: &mut Vec<Vec<Item>>,
                     current: &mut Vec<Item>,
                     current_len: &mut usize| {
        if *current_len + len > limit && !current.is_empty() {
            batches.push(std::mem::take(current));
            *current_len = 0;
        }
        *current_len += len;
        current.push(item);
    };

    for item in items {
        let len = item.encoded_len(needs_values).map_err(Error::Protocol)?;
        if len <= limit {
            place(item, len, &mut batches, &mut current, &mut current_len);
            continue;
        }
        for part in split_item(item, limit, needs_values)? {
            let part_len = part.encoded_len(needs_values).map_err(Error::Protocol)?;
            place(part, part_len, &mut batches, &mut current, &mut current_len);
        }
    }
    if !current.is_empty() || batches.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

/// Split one oversize item into range- or index-contiguous parts that each
/// fit `limit`. Only fixed-size encodings can be split.
fn split_item(item: Item, limit: usize, needs_values: bool) -> Result<Vec<Item>> {
    let Size::Fixed(size) = item.variation.descriptor().size else {
        return Err(ProtocolError::SegmentBufferOverflow.into());
    };
    if !needs_values || item.instances.is_empty() {
        return Err(ProtocolError::SegmentBufferOverflow.into());
    }

    match (&item.range, item.prefix) {
        (RangeSpecifier::StartStopIndex { start, .. }, PrefixCode::None) => {
            // Worst-case header: 3 octets + two 32-bit range fields.
            let per_fragment = (limit - 11) / size;
            if per_fragment == 0 {
                return Err(ProtocolError::SegmentBufferOverflow.into());
            }
            let start = *start;
            let mut parts = Vec::new();
            for (chunk_index, chunk) in item.instances.chunks(per_fragment).enumerate() {
                parts.push(Item::range_values(
                    item.variation,
                    start + (chunk_index * per_fragment) as u32,
                    chunk.to_vec(),
                ));
            }
            Ok(parts)
        }
        (RangeSpecifier::Count { .. }, prefix) if prefix.is_index() => {
            let index_width = prefix.width().map_or(0, |w| w.size());
            let per_fragment = (limit - 7) / (size + index_width);
            if per_fragment == 0 {
                return Err(ProtocolError::SegmentBufferOverflow.into());
            }
            let mut parts = Vec::new();
            let pairs: Vec<(u32, crate::objects::ObjectInstance)> = item
                .indices
                .iter()
                .copied()
                .zip(item.instances.iter().copied())
                .collect();
            for chunk in pairs.chunks(per_fragment) {
                parts.push(Item::indexed_values(item.variation, chunk.to_vec()));
            }
            Ok(parts)
        }
        _ => Err(ProtocolError::SegmentBufferOverflow.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::layer::Outbound;
    use crate::link::{DataLinkLayer, Frame};
    use crate::objects::{ObjectInstance, Variation};
    use bytes::Bytes;

    fn stack(max_fragment: usize) -> (Arc<DataLinkLayer>, ApplicationLayer) {
        let link = Arc::new(DataLinkLayer::new(
            1,
            2,
            false,
            Duration::from_millis(100),
            Outbound::new(),
        ));
        let transport = Arc::new(TransportFunction::new(link.clone(), max_fragment));
        let app = ApplicationLayer::new(
            transport,
            Arc::new(ConfirmMonitor::new()),
            Duration::from_millis(100),
            false,
        );
        (link, app)
    }

    async fn inject_fragment(link: &Arc<DataLinkLayer>, fragment: &Fragment) {
        let bytes = fragment.serialize().unwrap();
        // Single-TPDU transport wrapping: FIR|FIN|seq 0.
        let mut tpdu = vec![0xC0];
        tpdu.extend_from_slice(&bytes);
        let frame = Frame::unconfirmed_user_data(1, 2, true, Bytes::from(tpdu));
        link.on_frame(&frame).await.unwrap();
    }

    #[test]
    fn sequences_wrap_mod_16() {
        let (_, app) = stack(2048);
        for expected in (0..16).chain(0..4) {
            assert_eq!(app.next_solicited_sequence(), expected);
        }
        for expected in (0..16).chain(0..2) {
            assert_eq!(app.next_unsolicited_sequence(), expected);
        }
    }

    #[tokio::test]
    async fn receive_returns_parsed_fragment() {
        let (link, app) = stack(2048);
        let sent = Fragment::request(
            FunctionCode::Read,
            AppControl::single(3),
            vec![Item::all(Variation::Class0Data)],
        );
        inject_fragment(&link, &sent).await;
        let received = app.receive().await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn confirm_releases_matching_waiter_only() {
        let (link, app) = stack(2048);
        let rx_match = app.confirm.expect(5, false);
        let rx_other = app.confirm.expect(6, false);

        inject_fragment(&link, &Fragment::confirm(5, false)).await;
        // Push a real fragment behind it so receive() returns.
        inject_fragment(
            &link,
            &Fragment::request(FunctionCode::Read, AppControl::single(0), vec![]),
        )
        .await;
        app.receive().await.unwrap();

        assert!(rx_match.await.is_ok());
        // The non-matching waiter is still pending; dropping the monitor
        // reference fails it.
        app.confirm.fail_all();
        assert!(rx_other.await.is_err());
    }

    #[tokio::test]
    async fn object_unknown_iin_propagates() {
        let (link, app) = stack(2048);
        let response = Fragment::response(
            FunctionCode::Response,
            AppControl::single(1),
            Iin::new().with(Iin::OBJECT_UNKNOWN),
            vec![],
        );
        inject_fragment(&link, &response).await;
        assert!(matches!(
            app.receive().await,
            Err(Error::Protocol(ProtocolError::ObjectUnknown))
        ));
    }

    #[tokio::test]
    async fn parameter_error_iin_propagates() {
        let (link, app) = stack(2048);
        let response = Fragment::response(
            FunctionCode::Response,
            AppControl::single(1),
            Iin::new().with(Iin::PARAMETER_ERROR),
            vec![],
        );
        inject_fragment(&link, &response).await;
        assert!(matches!(
            app.receive().await,
            Err(Error::Protocol(ProtocolError::ParameterError))
        ));
    }

    #[tokio::test]
    async fn no_func_code_support_is_accepted() {
        let (link, app) = stack(2048);
        let response = Fragment::response(
            FunctionCode::Response,
            AppControl::single(1),
            Iin::new().with(Iin::NO_FUNC_CODE_SUPPORT),
            vec![],
        );
        inject_fragment(&link, &response).await;
        let received = app.receive().await.unwrap();
        assert!(received.iin.unwrap().is_set(Iin::NO_FUNC_CODE_SUPPORT));
    }

    #[tokio::test]
    async fn multi_fragment_message_is_merged() {
        let (link, app) = stack(2048);
        let first = Fragment::response(
            FunctionCode::Response,
            AppControl {
                fir: true,
                fin: false,
                con: false,
                uns: false,
                seq: 6,
            },
            Iin::new(),
            vec![Item::range_values(
                Variation::AnalogInput16,
                0,
                vec![ObjectInstance::AnalogI16 { value: 1, flags: None }],
            )],
        );
        let second = Fragment::response(
            FunctionCode::Response,
            AppControl {
                fir: false,
                fin: true,
                con: false,
                uns: false,
                seq: 7,
            },
            Iin::new().with(Iin::NEED_TIME),
            vec![Item::range_values(
                Variation::AnalogInput16,
                1,
                vec![ObjectInstance::AnalogI16 { value: 2, flags: None }],
            )],
        );
        inject_fragment(&link, &first).await;
        inject_fragment(&link, &second).await;
        let message = app.receive().await.unwrap();
        assert_eq!(message.items.len(), 2);
        assert!(message.iin.unwrap().is_set(Iin::NEED_TIME));
        assert!(message.control.fir && message.control.fin);
    }

    #[tokio::test]
    async fn fragment_sequence_gap_is_an_error() {
        let (link, app) = stack(2048);
        let first = Fragment::response(
            FunctionCode::Response,
            AppControl {
                fir: true,
                fin: false,
                con: false,
                uns: false,
                seq: 2,
            },
            Iin::new(),
            vec![],
        );
        let skipped = Fragment::response(
            FunctionCode::Response,
            AppControl {
                fir: false,
                fin: true,
                con: false,
                uns: false,
                seq: 4,
            },
            Iin::new(),
            vec![],
        );
        inject_fragment(&link, &first).await;
        inject_fragment(&link, &skipped).await;
        assert!(matches!(
            app.receive().await,
            Err(Error::Protocol(ProtocolError::UnexpectedFragment))
        ));
    }

    #[test]
    fn pack_items_splits_large_responses() {
        // S3: 4000 bytes of objects with a 2048 cap -> two fragments.
        let instances: Vec<ObjectInstance> = (0..1000)
            .map(|i| ObjectInstance::AnalogI32 {
                value: i,
                flags: None,
            })
            .collect();
        let item = Item::range_values(Variation::AnalogInput32, 0, instances);
        let batches = pack_items(vec![item], 2048 - 4, true).unwrap();
        assert_eq!(batches.len(), 2);
        let first_len: usize = batches[0]
            .iter()
            .map(|i| i.encoded_len(true).unwrap())
            .sum();
        assert!(first_len <= 2048 - 4);
        // All 1000 instances survive the split.
        let total: usize = batches
            .iter()
            .flat_map(|b| b.iter())
            .map(|i| i.instances.len())
            .sum();
        assert_eq!(total, 1000);
        // Ranges stay contiguous.
        let second_start = batches[1][0].range.start_index().unwrap();
        let first_count = batches[0][0].instances.len() as u32;
        assert_eq!(second_start, first_count);
    }

    #[test]
    fn pack_items_keeps_small_items_together() {
        let items = vec![
            Item::read_range(Variation::BinaryInputFlags, 0, 10),
            Item::all(Variation::Class1Data),
        ];
        let batches = pack_items(items.clone(), 2046, false).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], items);
    }

    #[test]
    fn empty_message_still_yields_one_fragment() {
        let batches = pack_items(vec![], 2046, false).unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
    }
}
