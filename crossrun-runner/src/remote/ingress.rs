// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoding and publishing of HTTP ingress batches.
//!
//! The HTTP-serving collaborator owns the socket; this module owns the wire
//! format and the publish/wait behavior for its sequencing endpoint. A POST
//! body is a JSON array of JSON-encoded strings, each decoding to one
//! [`SequencedMessage`].

use crate::{
    errors::IngressError,
    remote::{SequencedMessage, Sequencer},
};
use smol_str::SmolStr;
use std::collections::HashSet;
use tracing::debug;

/// Which published messages hold the HTTP response open until their delivery
/// turn completes.
#[derive(Clone, Debug, Default)]
pub enum WaitPolicy {
    /// Wait for every message. The correctness-first default: publish and
    /// delivery errors always surface on the response.
    #[default]
    Always,

    /// Never wait; respond as soon as every message is published.
    Never,

    /// Wait only for messages with one of these event names.
    Events(HashSet<SmolStr>),
}

impl WaitPolicy {
    fn should_wait(&self, name: &SmolStr) -> bool {
        match self {
            WaitPolicy::Always => true,
            WaitPolicy::Never => false,
            WaitPolicy::Events(names) => names.contains(name),
        }
    }
}

/// Decodes a POST body into its sequenced messages.
pub fn decode_batch(body: &str) -> Result<Vec<SequencedMessage>, IngressError> {
    let raw: Vec<String> = serde_json::from_str(body).map_err(IngressError::MalformedBody)?;
    raw.iter()
        .enumerate()
        .map(|(index, entry)| {
            serde_json::from_str(entry)
                .map_err(|source| IngressError::MalformedMessage { index, source })
        })
        .collect()
}

/// Decodes and publishes one batch, waiting on receipts per the policy.
///
/// `Ok(())` maps to the collaborator's `204` path; any error maps to `500`.
pub async fn handle_batch(
    sequencer: &Sequencer,
    body: &str,
    policy: &WaitPolicy,
) -> Result<(), IngressError> {
    let messages = decode_batch(body)?;
    debug!(count = messages.len(), "publishing ingress batch");

    let mut waits = Vec::new();
    for message in messages {
        let wait = policy.should_wait(&message.payload.name);
        let receipt = sequencer.publish(message).await?;
        if wait {
            waits.push(receipt);
        }
        // A dropped receipt does not cancel the message; it still gets
        // delivered when its turn comes.
    }
    for receipt in waits {
        receipt.wait().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::ListenerError, remote::SessionListener};
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    fn encode_batch(messages: &[serde_json::Value]) -> String {
        let encoded: Vec<String> = messages
            .iter()
            .map(|message| serde_json::to_string(message).unwrap())
            .collect();
        serde_json::to_string(&encoded).unwrap()
    }

    #[derive(Default)]
    struct NameRecorder {
        names: Mutex<Vec<String>>,
    }

    impl SessionListener for NameRecorder {
        fn deliver<'a>(
            &'a self,
            message: &'a SequencedMessage,
        ) -> BoxFuture<'a, Result<(), ListenerError>> {
            Box::pin(async move {
                self.names
                    .lock()
                    .unwrap()
                    .push(message.payload.name.to_string());
                Ok(())
            })
        }
    }

    #[test]
    fn decode_batch_rejects_malformed_entries() {
        assert!(matches!(
            decode_batch("not json"),
            Err(IngressError::MalformedBody(_))
        ));

        let body = serde_json::to_string(&vec!["{\"broken\":"]).unwrap();
        assert!(matches!(
            decode_batch(&body),
            Err(IngressError::MalformedMessage { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn handle_batch_publishes_out_of_order_entries() {
        let sequencer = Sequencer::new();
        let recorder = Arc::new(NameRecorder::default());
        let _subscription = sequencer.subscribe("s1", recorder.clone());

        let body = encode_batch(&[
            serde_json::json!({ "sessionId": "s1", "sequence": 1, "payload": ["testEnd"] }),
            serde_json::json!({ "sessionId": "s1", "sequence": 0, "payload": ["testStart"] }),
        ]);
        handle_batch(&sequencer, &body, &WaitPolicy::Always)
            .await
            .unwrap();

        assert_eq!(
            recorder.names.lock().unwrap().clone(),
            ["testStart", "testEnd"]
        );
    }

    #[tokio::test]
    async fn handle_batch_surfaces_sequence_violations() {
        let sequencer = Sequencer::new();
        let body = encode_batch(&[
            serde_json::json!({ "sessionId": "s1", "sequence": 0, "payload": ["testStart"] }),
            serde_json::json!({ "sessionId": "s1", "sequence": 0, "payload": ["testStart"] }),
        ]);
        let error = handle_batch(&sequencer, &body, &WaitPolicy::Never)
            .await
            .unwrap_err();
        assert!(matches!(error, IngressError::Sequence(_)));
    }
}
