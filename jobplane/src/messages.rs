//! # Protocol Messages
//!
//! This module defines the message types exchanged by the job dispatch
//! protocol. The protocol is a broadcast-emulated request/response pair:
//!
//! 1. **DeployRequest**: published on the request topic, names exactly one
//!    target peer which runs the program
//! 2. **DeployResponse**: published by the target on the response topic,
//!    meaningful only to the peer named as its source
//!
//! Messages are JSON encoded. Unknown fields are ignored when decoding so that
//! newer peers can add fields without breaking older ones. Peer identity fields
//! are opaque strings and are compared case-sensitively.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted size of an inbound protocol message (4 MiB).
///
/// Larger payloads are rejected before parsing to bound memory use.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Job submission as received from the ingress layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JobRequest {
    /// Program to execute, resolved through `PATH` on the target
    pub program: String,
    /// Arguments passed verbatim to the program
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl JobRequest {
    /// Rejects jobs that cannot be dispatched.
    pub fn validate(&self) -> Result<(), String> {
        if self.program.trim().is_empty() {
            return Err("program is required".to_string());
        }
        Ok(())
    }
}

/// Request for a specific peer to run a program.
///
/// Every node on the request topic receives every request; only the node
/// whose identity equals `target_peer_id` acts on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeployRequest {
    /// Identity of the requesting node (receives the response)
    pub source_peer_id: String,
    /// Overlay addresses of the requesting node
    #[serde(default)]
    pub source_addrs: Vec<String>,
    /// Identity of the node that should execute the program
    pub target_peer_id: String,
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Outcome of a [`DeployRequest`], published by the target node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeployResponse {
    /// True when the program started and exited with status 0
    pub success: bool,
    /// Failure description, empty on success
    #[serde(default)]
    pub err: String,
    /// Identity of the original requester (correlation key)
    pub source_peer_id: String,
    #[serde(default)]
    pub source_addrs: Vec<String>,
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Process id on the target, absent when the program never started
    #[serde(default)]
    pub pid: Option<u32>,
    /// Identity of the node that executed the program
    pub target_peer_id: String,
    /// Overlay addresses of the executing node
    #[serde(default)]
    pub target_addrs: Vec<String>,
    /// Captured output in arrival order
    #[serde(default)]
    pub outputs: Vec<OutputLine>,
}

/// Origin of a captured output line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OutputStream {
    /// Standard output
    Info,
    /// Standard error
    Error,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Info => "Info",
            OutputStream::Error => "Error",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of program output tagged with the stream it came from.
///
/// On the wire a line is the string `"<Tag>: <text>"`, e.g. `"Info: ok"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Info,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Error,
            text: text.into(),
        }
    }
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stream, self.text)
    }
}

impl From<OutputLine> for String {
    fn from(line: OutputLine) -> Self {
        line.to_string()
    }
}

impl From<String> for OutputLine {
    /// Untagged strings are treated as standard output.
    fn from(raw: String) -> Self {
        match raw.split_once(": ") {
            Some(("Info", text)) => OutputLine::info(text),
            Some(("Error", text)) => OutputLine::error(text),
            _ => OutputLine::info(raw),
        }
    }
}

/// Errors produced while decoding an inbound protocol message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message too large: {size} bytes exceeds {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serializes a protocol message for publication.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Decodes a protocol message received from the network.
///
/// Enforces [`MAX_MESSAGE_SIZE`] before parsing. Always use this instead of
/// calling `serde_json` directly on network input.
pub fn decode<'a, T>(bytes: &'a [u8]) -> Result<T, DecodeError>
where
    T: Deserialize<'a>,
{
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> DeployRequest {
        DeployRequest {
            source_peer_id: "12D3KooWSource".to_string(),
            source_addrs: vec!["/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWSource".to_string()],
            target_peer_id: "12D3KooWTarget".to_string(),
            program: "echo".to_string(),
            arguments: vec!["hello".to_string(), "world".to_string()],
        }
    }

    #[test]
    fn request_survives_encode_decode() {
        let request = sample_request();
        let bytes = encode(&request).unwrap();
        let decoded: DeployRequest = decode(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let raw = br#"{
            "source_peer_id": "a",
            "target_peer_id": "b",
            "program": "ls",
            "arguments": ["-l"],
            "priority": 7
        }"#;
        let decoded: DeployRequest = decode(raw).unwrap();
        assert_eq!(decoded.program, "ls");
        assert!(decoded.source_addrs.is_empty());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode::<DeployRequest>(b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let big = vec![b' '; MAX_MESSAGE_SIZE + 1];
        let err = decode::<DeployRequest>(&big).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { .. }));
    }

    #[test]
    fn output_lines_use_tagged_strings_on_the_wire() {
        let response = DeployResponse {
            success: true,
            outputs: vec![OutputLine::info("ok"), OutputLine::error("warn: x")],
            ..Default::default()
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["outputs"], serde_json::json!(["Info: ok", "Error: warn: x"]));

        let decoded: DeployResponse = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.outputs[1], OutputLine::error("warn: x"));
    }

    #[test]
    fn untagged_output_is_treated_as_info() {
        let line = OutputLine::from("plain text".to_string());
        assert_eq!(line, OutputLine::info("plain text"));
    }

    #[test]
    fn job_validation_requires_program() {
        assert!(JobRequest::default().validate().is_err());
        assert!(
            JobRequest {
                program: "  ".to_string(),
                arguments: vec![],
            }
            .validate()
            .is_err()
        );
        assert!(
            JobRequest {
                program: "echo".to_string(),
                arguments: vec![],
            }
            .validate()
            .is_ok()
        );
    }
}
