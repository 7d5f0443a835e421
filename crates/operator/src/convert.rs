//! Row ↔ wire conversions.

use bytes::Bytes;
use prost::Message as _;

use storage::leaf::{LeafStore, TreeNode};
use storage::transfer::TransferRow;
use transport::spark;

/// UNIX seconds from a wire timestamp, clamped at zero.
pub(crate) fn timestamp_secs(ts: Option<&::prost_types::Timestamp>) -> Option<u64> {
    ts.map(|t| t.seconds.max(0) as u64)
}

/// Wire timestamp from UNIX seconds.
pub(crate) fn timestamp_from_unix(secs: u64) -> ::prost_types::Timestamp {
    ::prost_types::Timestamp {
        seconds: secs as i64,
        nanos: 0,
    }
}

/// A tree node row in wire form.
pub(crate) fn tree_node_to_proto(node: &TreeNode) -> spark::TreeNodeProto {
    spark::TreeNodeProto {
        id: node.id.clone(),
        tree_id: node.tree_id.clone(),
        value: node.value,
        owner_identity_pubkey: Bytes::copy_from_slice(&node.owner_identity_pubkey),
        owner_signing_pubkey: Bytes::copy_from_slice(&node.owner_signing_pubkey),
        verifying_pubkey: Bytes::copy_from_slice(&node.verifying_pubkey),
        node_tx: Bytes::from(node.node_tx.clone()),
        refund_tx: node.refund_tx.clone().map(Bytes::from).unwrap_or_default(),
        direct_tx: node.direct_tx.clone().map(Bytes::from).unwrap_or_default(),
        direct_refund_tx: node
            .direct_refund_tx
            .clone()
            .map(Bytes::from)
            .unwrap_or_default(),
        direct_from_cpfp_refund_tx: node
            .direct_from_cpfp_refund_tx
            .clone()
            .map(Bytes::from)
            .unwrap_or_default(),
        parent_id: node.parent_id.clone(),
        vout: node.vout,
        network: node.network.to_proto(),
        status: node.status.as_str().to_owned(),
    }
}

/// A transfer row in wire form, with leaf detail resolved through the
/// leaf store.
pub(crate) fn transfer_to_proto(row: &TransferRow, leaves: &dyn LeafStore) -> spark::TransferProto {
    let leaf_protos = row
        .leaves
        .iter()
        .map(|state| spark::TransferLeafProto {
            leaf: leaves.get(&state.leaf_id).ok().map(|n| tree_node_to_proto(&n)),
            secret_cipher: Bytes::from(state.secret_cipher.clone()),
            signature: Bytes::from(state.sender_signature.clone()),
            pending_cpfp_refund_tx: Bytes::from(state.pending_cpfp_refund_tx.clone()),
            pending_direct_refund_tx: state
                .pending_direct_refund_tx
                .clone()
                .map(Bytes::from)
                .unwrap_or_default(),
            pending_direct_from_cpfp_refund_tx: state
                .pending_direct_from_cpfp_refund_tx
                .clone()
                .map(Bytes::from)
                .unwrap_or_default(),
        })
        .collect();

    spark::TransferProto {
        id: row.id.clone(),
        transfer_type: row.transfer_type.to_proto(),
        status: row.status.to_proto(),
        sender_identity_pubkey: Bytes::copy_from_slice(&row.sender_identity),
        receiver_identity_pubkey: Bytes::copy_from_slice(&row.receiver_identity),
        expiry_time: Some(timestamp_from_unix(row.expiry_time)),
        network: row.network.to_proto(),
        leaves: leaf_protos,
    }
}

/// Encode signing results for persistence on the transfer row.
pub(crate) fn encode_signing_results(results: &[spark::LeafSigningResult]) -> Vec<u8> {
    spark::LeafSigningResults {
        results: results.to_vec(),
    }
    .encode_to_vec()
}

/// Decode persisted signing results; a decode failure yields an empty
/// set rather than an error (the blob is advisory, for retries).
pub(crate) fn decode_signing_results(blob: &[u8]) -> Vec<spark::LeafSigningResult> {
    spark::LeafSigningResults::decode(blob)
        .map(|r| r.results)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrip_clamps_negative() {
        assert_eq!(timestamp_secs(Some(&timestamp_from_unix(1000))), Some(1000));
        let negative = ::prost_types::Timestamp {
            seconds: -5,
            nanos: 0,
        };
        assert_eq!(timestamp_secs(Some(&negative)), Some(0));
        assert_eq!(timestamp_secs(None), None);
    }

    #[test]
    fn signing_results_blob_roundtrip() {
        let results = vec![spark::LeafSigningResult {
            leaf_id: "leaf-1".into(),
            verifying_pubkey: Bytes::from_static(&[0x02; 33]),
            cpfp: Some(spark::SigningResultProto {
                final_signature: Bytes::from_static(&[0xAB; 64]),
                ..Default::default()
            }),
            direct: None,
            direct_from_cpfp: None,
        }];
        let blob = encode_signing_results(&results);
        assert_eq!(decode_signing_results(&blob), results);
        assert!(decode_signing_results(&[0xFF, 0xFF]).is_empty());
    }
}
