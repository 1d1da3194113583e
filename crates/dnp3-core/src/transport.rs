use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::link::DataLinkLayer;

/// One TPDU carries the transport octet plus at most 249 data bytes.
pub const MAX_TPDU_DATA: usize = 249;

const TH_FIR: u8 = 0x80;
const TH_FIN: u8 = 0x40;
const TH_SEQ_MASK: u8 = 0x3F;

fn next_seq(seq: u8) -> u8 {
    seq.wrapping_add(1) & TH_SEQ_MASK
}

/// Segmentation and reassembly between the application layer and the link.
/// Fragments are split into TPDUs with FIR/FIN markers and a sequence that
/// increments mod 64 per TPDU within the association.
pub struct TransportFunction {
    link: Arc<DataLinkLayer>,
    max_fragment_size: usize,
    tx_seq: Mutex<u8>,
}

impl TransportFunction {
    pub fn new(link: Arc<DataLinkLayer>, max_fragment_size: usize) -> Self {
        Self {
            link,
            max_fragment_size,
            tx_seq: Mutex::new(0),
        }
    }

    pub fn link(&self) -> &Arc<DataLinkLayer> {
        &self.link
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    /// Send one application fragment. The caller serializes calls per
    /// association; interleaving TPDUs of two fragments would corrupt the
    /// peer's reassembly.
    pub async fn send(&self, fragment: &[u8]) -> Result<()> {
        if fragment.is_empty() {
            return Err(ProtocolError::MissingFrameData.into());
        }
        if fragment.len() > self.max_fragment_size {
            return Err(ProtocolError::SegmentBufferOverflow.into());
        }
        let chunk_count = fragment.len().div_ceil(MAX_TPDU_DATA);
        // Claim the sequence run for the whole fragment up front.
        let first_seq = {
            let mut seq = self.tx_seq.lock();
            let first = *seq;
            let mut claimed = *seq;
            for _ in 0..chunk_count {
                claimed = next_seq(claimed);
            }
            *seq = claimed;
            first
        };
        let mut seq = first_seq;
        for (index, chunk) in fragment.chunks(MAX_TPDU_DATA).enumerate() {
            let mut header = seq;
            if index == 0 {
                header |= TH_FIR;
            }
            if index == chunk_count - 1 {
                header |= TH_FIN;
            }
            let mut tpdu = BytesMut::with_capacity(1 + chunk.len());
            tpdu.put_u8(header);
            tpdu.put_slice(chunk);
            self.link.send(&tpdu).await?;
            seq = next_seq(seq);
        }
        Ok(())
    }

    /// Block until one complete fragment is reassembled. A FIR mid-fragment
    /// or a sequence gap discards the partial fragment.
    pub async fn receive(&self) -> Result<Bytes> {
        let mut partial: Option<(u8, BytesMut)> = None;
        loop {
            let segment = self.link.receive().await?;
            if segment.is_empty() {
                continue;
            }
            let header = segment[0];
            let fir = header & TH_FIR != 0;
            let fin = header & TH_FIN != 0;
            let seq = header & TH_SEQ_MASK;
            let data = &segment[1..];
            if data.is_empty() {
                debug!("empty TPDU ignored");
                continue;
            }

            if fir {
                if partial.is_some() {
                    debug!("FIR mid-fragment; discarding partial fragment");
                }
                let mut buf = BytesMut::with_capacity(data.len());
                buf.put_slice(data);
                partial = Some((next_seq(seq), buf));
            } else {
                match partial.take() {
                    Some((expected, mut buf)) if seq == expected => {
                        buf.put_slice(data);
                        partial = Some((next_seq(seq), buf));
                    }
                    Some((expected, _)) => {
                        warn!(
                            expected,
                            got = seq,
                            "transport sequence gap; discarding partial fragment"
                        );
                        continue;
                    }
                    None => {
                        debug!("TPDU without FIR; ignored");
                        continue;
                    }
                }
            }

            let Some((next_expected, buf)) = partial.take() else {
                continue;
            };
            if buf.len() > self.max_fragment_size {
                warn!(
                    "{}; discarding oversize fragment",
                    ProtocolError::SegmentBufferOverflow
                );
                continue;
            }
            if fin {
                return Ok(buf.freeze());
            }
            partial = Some((next_expected, buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::layer::Outbound;
    use std::time::Duration;

    /// A link layer with no bound connection: send fails, but the inbound
    /// queue is usable for driving the reassembler directly.
    fn detached_link() -> Arc<DataLinkLayer> {
        Arc::new(DataLinkLayer::new(
            1,
            2,
            false,
            Duration::from_millis(100),
            Outbound::new(),
        ))
    }

    fn tpdu(fir: bool, fin: bool, seq: u8, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        let mut header = seq & TH_SEQ_MASK;
        if fir {
            header |= TH_FIR;
        }
        if fin {
            header |= TH_FIN;
        }
        buf.put_u8(header);
        buf.put_slice(data);
        buf.freeze()
    }

    async fn inject(link: &Arc<DataLinkLayer>, tpdu: Bytes) {
        use crate::link::frame::Frame;
        let frame = Frame::unconfirmed_user_data(1, 2, true, tpdu);
        link.on_frame(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn in_order_tpdus_reassemble() {
        let link = detached_link();
        let transport = TransportFunction::new(link.clone(), 2048);
        inject(&link, tpdu(true, false, 10, &[1u8; MAX_TPDU_DATA])).await;
        inject(&link, tpdu(false, false, 11, &[2u8; MAX_TPDU_DATA])).await;
        inject(&link, tpdu(false, true, 12, &[3u8; 7])).await;
        let fragment = transport.receive().await.unwrap();
        assert_eq!(fragment.len(), 2 * MAX_TPDU_DATA + 7);
        assert_eq!(fragment[0], 1);
        assert_eq!(fragment[MAX_TPDU_DATA], 2);
        assert_eq!(fragment[2 * MAX_TPDU_DATA], 3);
    }

    #[tokio::test]
    async fn sequence_gap_discards_partial() {
        let link = detached_link();
        let transport = TransportFunction::new(link.clone(), 2048);
        inject(&link, tpdu(true, false, 0, b"aaa")).await;
        // Sequence 2 skips 1: partial dropped.
        inject(&link, tpdu(false, true, 2, b"bbb")).await;
        // A complete replacement fragment follows.
        inject(&link, tpdu(true, true, 9, b"ok")).await;
        let fragment = transport.receive().await.unwrap();
        assert_eq!(&fragment[..], b"ok");
    }

    #[tokio::test]
    async fn fir_mid_fragment_replaces_partial() {
        let link = detached_link();
        let transport = TransportFunction::new(link.clone(), 2048);
        inject(&link, tpdu(true, false, 0, b"old")).await;
        inject(&link, tpdu(true, true, 5, b"new")).await;
        let fragment = transport.receive().await.unwrap();
        assert_eq!(&fragment[..], b"new");
    }

    #[tokio::test]
    async fn sequence_wraps_mod_64() {
        let link = detached_link();
        let transport = TransportFunction::new(link.clone(), 2048);
        inject(&link, tpdu(true, false, 63, b"a")).await;
        inject(&link, tpdu(false, true, 0, b"b")).await;
        let fragment = transport.receive().await.unwrap();
        assert_eq!(&fragment[..], b"ab");
    }

    #[tokio::test]
    async fn oversize_fragment_rejected_on_send() {
        let link = detached_link();
        let transport = TransportFunction::new(link, 128);
        let result = transport.send(&[0u8; 129]).await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Protocol(
                ProtocolError::SegmentBufferOverflow
            ))
        ));
    }
}
