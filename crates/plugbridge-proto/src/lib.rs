//! Wire schema for the plugbridge host/plugin protocol
//!
//! Generated from `proto/bridge.proto`. The same messages are used by both
//! transports: the gRPC transport sends them as tonic requests, and the
//! netrpc transport frames them itself.

#![deny(clippy::unwrap_used)]

/// Version 1 of the bridge protocol
pub mod v1 {
    tonic::include_proto!("plugbridge.v1");
}

pub use v1::{
    CallError, CallRequest, CallResponse, ConnInfo, DispenseRequest, Empty, ErrorKind,
};

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_empty_call_request_encodes_to_zero_bytes() {
        let request = CallRequest::default();
        assert_eq!(request.encoded_len(), 0);
    }

    #[test]
    fn test_call_error_kind_accessor() {
        let mut error = CallError::default();
        assert_eq!(error.kind(), ErrorKind::Unspecified);

        error.set_kind(ErrorKind::Business);
        assert_eq!(error.kind(), ErrorKind::Business);
    }

    #[test]
    fn test_call_response_decode() -> Result<(), prost::DecodeError> {
        let response = CallResponse {
            payload: vec![1, 2, 3],
            error: None,
        };
        let bytes = response.encode_to_vec();
        let decoded = CallResponse::decode(bytes.as_slice())?;
        assert_eq!(decoded.payload, vec![1, 2, 3]);
        assert!(decoded.error.is_none());
        Ok(())
    }
}
