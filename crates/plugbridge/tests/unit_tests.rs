//! Unit tests for the public API

mod handshake_tests {
    use plugbridge::HandshakeError;
    use plugbridge::handshake::{HandshakeConfig, HandshakeLine, Network, PluginEnv, Protocol};

    #[test]
    fn test_core_version_checked_before_the_rest() {
        let line = HandshakeLine {
            core_version: 2,
            protocol_version: 9,
            network: Network::Tcp,
            address: "127.0.0.1:1".to_string(),
            protocol: Protocol::Grpc,
            server_cert: None,
        };
        assert!(matches!(
            line.validate(&[1], &[Protocol::NetRpc]),
            Err(HandshakeError::CoreVersion { .. })
        ));
    }

    #[test]
    fn test_cookie_mismatch_explains_itself() {
        let config = HandshakeConfig::new(1, "COOKIE", "value");
        let env = PluginEnv::from_pairs([("COOKIE", "other")]);
        let err = config.check_cookie(&env);
        assert!(matches!(err, Err(HandshakeError::CookieMismatch { ref key }) if key == "COOKIE"));
        let message = err.map_err(|e| e.to_string()).err().unwrap_or_default();
        assert!(message.contains("launched by its host"));
    }

    #[test]
    fn test_missing_version_list_is_empty() {
        assert!(PluginEnv::default().protocol_versions().is_empty());
    }
}

mod codec_tests {
    use plugbridge::codec::{
        MessageCodec, MessageHeader, decode_payload, encode_payload, message_flags,
        message_types, read_frame, write_frame,
    };
    use plugbridge::{BridgeError, BridgeResult, TransportResult};
    use plugbridge_proto::CallRequest;

    #[test]
    fn test_codec_creation() {
        let codec = MessageCodec::new();
        assert_eq!(codec.max_message_size(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_valid_size_check() {
        let codec = MessageCodec::with_max_size(1000);
        assert!(codec.is_valid_size(0));
        assert!(codec.is_valid_size(1000));
        assert!(!codec.is_valid_size(1001));
    }

    #[test]
    fn test_header_flags() -> TransportResult<()> {
        let mut header = MessageHeader::new(message_types::RESPONSE, 10, 7);
        assert!(!header.has_flag(message_flags::IS_ERROR));
        header.set_flag(message_flags::IS_ERROR);

        let decoded = MessageHeader::decode(&header.encode())?;
        assert!(decoded.has_flag(message_flags::IS_ERROR));
        assert_eq!(decoded.sequence, 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_frame_over_duplex() -> TransportResult<()> {
        let codec = MessageCodec::new();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let request = CallRequest {
            plugin: "kv".to_string(),
            method: "get".to_string(),
            payload: b"\"k\"".to_vec(),
        };
        let payload = codec.encode(&request)?;
        write_frame(&mut a, MessageHeader::new(message_types::CALL, 0, 5), &payload).await?;
        drop(a);

        let frame = read_frame(&mut b, &codec).await?;
        let Some(frame) = frame else {
            return Err(plugbridge::TransportError::Closed);
        };
        assert_eq!(frame.header.sequence, 5);
        assert_eq!(frame.header.payload_len as usize, payload.len());
        assert_eq!(codec.decode::<CallRequest>(&frame.payload)?, request);

        assert!(read_frame(&mut b, &codec).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() -> TransportResult<()> {
        let small = MessageCodec::with_max_size(4);
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, MessageHeader::new(message_types::CALL, 0, 1), &[0u8; 8]).await?;
        assert!(read_frame(&mut b, &small).await.is_err());
        Ok(())
    }

    #[test]
    fn test_payload_codec_errors() -> BridgeResult<()> {
        let bytes = encode_payload(&(1u8, "two"))?;
        let decoded: (u8, String) = decode_payload(&bytes)?;
        assert_eq!(decoded, (1, "two".to_string()));

        let wrong: BridgeResult<u64> = decode_payload(b"\"text\"");
        assert!(matches!(wrong, Err(BridgeError::Codec(_))));
        Ok(())
    }
}

mod error_tests {
    use plugbridge::{BridgeError, RemoteError, TransportError};

    #[test]
    fn test_wire_round_trip_keeps_category() {
        let cases = vec![
            BridgeError::business("not_found", "no such key"),
            BridgeError::UnknownPlugin("kv".to_string()),
            BridgeError::unknown_method("kv", "delete"),
            BridgeError::Codec("bad json".to_string()),
        ];
        for error in cases {
            let back = BridgeError::from_wire(error.to_wire());
            assert_eq!(
                std::mem::discriminant(&back),
                std::mem::discriminant(&error)
            );
            assert_eq!(back.to_string(), error.to_string());
        }
    }

    #[test]
    fn test_other_errors_become_internal() {
        let error = BridgeError::from(TransportError::Closed);
        let back = BridgeError::from_wire(error.to_wire());
        assert!(matches!(back, BridgeError::Internal(_)));
    }

    #[test]
    fn test_classification() {
        let business = BridgeError::Business(RemoteError::new("quota", "over quota"));
        assert!(business.is_business());
        assert!(!business.is_transport());
        assert!(!business.is_fatal());
        assert_eq!(business.remote().map(|r| r.code.as_str()), Some("quota"));

        let closed = BridgeError::from(TransportError::Closed);
        assert!(closed.is_transport());
        assert!(closed.is_fatal());
    }
}

mod adapter_tests {
    use std::sync::Arc;

    use plugbridge::prelude::*;
    use plugbridge::LocalInvoker;

    struct Upper;

    #[async_trait]
    impl ServerAdapter for Upper {
        async fn dispatch(&self, call: &Call) -> BridgeResult<Vec<u8>> {
            match call.method.as_str() {
                "upper" => {
                    let text: String = call.args()?;
                    if text.is_empty() {
                        return Err(BridgeError::business("empty", "nothing to convert"));
                    }
                    reply(&text.to_uppercase())
                }
                _ => Err(call.unknown_method()),
            }
        }
    }

    fn channel() -> CallChannel {
        CallChannel::new("upper", Arc::new(LocalInvoker::new(Arc::new(Upper))))
    }

    #[tokio::test]
    async fn test_local_call() -> BridgeResult<()> {
        let channel = channel();
        assert_eq!(channel.plugin(), "upper");
        assert!(!channel.is_closed());

        let shouted: String = channel.call("upper", "quiet").await?;
        assert_eq!(shouted, "QUIET");
        Ok(())
    }

    #[tokio::test]
    async fn test_local_errors_match_remote_shape() {
        let channel = channel();
        let empty: BridgeResult<String> = channel.call("upper", "").await;
        assert!(matches!(empty, Err(BridgeError::Business(ref r)) if r.code == "empty"));

        let unknown: BridgeResult<String> = channel.call("lower", "x").await;
        assert!(matches!(unknown, Err(BridgeError::UnknownMethod { .. })));

        let bad_args: BridgeResult<String> = channel.call("upper", &42).await;
        assert!(matches!(bad_args, Err(BridgeError::Codec(_))));
    }
}

mod registry_tests {
    use std::sync::Arc;

    use plugbridge::prelude::*;
    use plugbridge::registry::RESERVED_PREFIX;

    struct Noop;

    impl Plugin for Noop {
        type Client = CallChannel;

        fn server(&self, _broker: &Broker) -> BridgeResult<Arc<dyn ServerAdapter>> {
            Err(BridgeError::Unbound("noop".to_string()))
        }

        fn client(&self, channel: CallChannel, _broker: &Broker) -> CallChannel {
            channel
        }
    }

    #[test]
    fn test_names_are_sorted_and_unique() -> BridgeResult<()> {
        let set = PluginSet::new().with("b", Noop)?.with("a", Noop)?;
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(set.len(), 2);

        let mut set = set;
        assert!(matches!(
            set.register("a", Noop),
            Err(BridgeError::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let name = format!("{RESERVED_PREFIX}anything");
        assert!(PluginSet::new().with(name, Noop).is_err());
    }

    #[test]
    fn test_host_only_plugin_cannot_serve() -> BridgeResult<()> {
        let set = PluginSet::new().with("noop", Noop)?;
        let result = set.server_for("noop", &Broker::detached());
        assert!(matches!(result, Err(BridgeError::Unbound(_))));
        Ok(())
    }
}
