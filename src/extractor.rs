use crate::{
    client::LogDecoder,
    types::{BlockNotification, Event, ReceiptProof},
};

/// Builds the receipt proofs of one block.
///
/// Receipts are visited in block order and their logs in emission order. Only logs emitted by
/// `bridge_address` are decoded; logs the decoder rejects are skipped. Every receipt with at least
/// one decoded event yields one [`ReceiptProof`], so the output is sorted by transaction index.
///
/// A notification without receipts yields no proofs.
#[must_use]
pub fn extract<H>(
    block: &BlockNotification<H>,
    bridge_address: &[u8],
    decoder: &impl LogDecoder,
) -> Vec<ReceiptProof> {
    let Some(receipts) = &block.receipts else {
        return Vec::new();
    };

    receipts
        .iter()
        .enumerate()
        .filter_map(|(index, receipt)| {
            let events: Vec<Event> = receipt
                .logs
                .iter()
                .filter(|log| log.address.as_ref() == bridge_address)
                .filter_map(|log| {
                    let event = decoder.decode(log);
                    if event.is_none() {
                        trace!(height = block.height, index = index, "Skipping undecodable bridge log");
                    }
                    event
                })
                .collect();

            (!events.is_empty()).then(|| ReceiptProof { index, height: block.height, events })
        })
        .collect()
}
