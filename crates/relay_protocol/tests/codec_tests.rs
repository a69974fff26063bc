use proptest::prelude::*;
use relay_domain::ChannelId;
use relay_protocol::{
	Badge, ChannelRef, DEFAULT_MAX_MESSAGE_SIZE, DonationBody, MessagePart, MessageType, OutboundEvent, PrivMsgBody,
	Profile, ProtocolError, Reply, Request, decode_event, decode_request, encode_event, encode_reply,
};
use serde_json::{Value, json};

fn profile() -> Profile {
	Profile {
		user_id: "viewer1".to_string(),
		nickname: "Viewer".to_string(),
		color: "#ff0000".to_string(),
		color_darkmode: "#ff8080".to_string(),
		badges: vec![Badge::role("manager")],
	}
}

#[test]
fn privmsg_event_wire_shape() {
	let event = OutboundEvent::Privmsg {
		channel_id: ChannelId::new("c1").unwrap(),
		body: PrivMsgBody {
			profile: profile(),
			message: vec![
				MessagePart::Text { text: "hi ".to_string() },
				MessagePart::Emote {
					name: "/wave/".to_string(),
					img_url: "https://img/wave.png".to_string(),
				},
			],
			timestamp: 1_700_000_000_000,
		},
	};

	let text = encode_event(&event).expect("encode");
	let value: Value = serde_json::from_str(&text).expect("json");
	assert_eq!(
		value,
		json!({
			"type": "PRIVMSG",
			"channelId": "c1",
			"body": {
				"profile": {
					"userId": "viewer1",
					"nickname": "Viewer",
					"color": "#ff0000",
					"colorDarkmode": "#ff8080",
					"badges": [{"name": "manager", "imgUrl": ""}]
				},
				"message": [
					{"type": "text", "text": "hi "},
					{"type": "emote", "name": "/wave/", "imgUrl": "https://img/wave.png"}
				],
				"timestamp": 1_700_000_000_000i64
			}
		})
	);

	assert_eq!(decode_event(&text).expect("decode"), event);
}

#[test]
fn donation_event_wire_shape() {
	let event = OutboundEvent::Donation {
		channel_id: ChannelId::new("c1").unwrap(),
		body: DonationBody {
			kind: "balloon".to_string(),
			profile: Profile {
				badges: Vec::new(),
				color: String::new(),
				color_darkmode: String::new(),
				..profile()
			},
			message: String::new(),
			count: 100,
			fan_join_order: 3,
			img_url: "balloon_100".to_string(),
			timestamp: 5,
		},
	};

	let value: Value = serde_json::from_str(&encode_event(&event).unwrap()).unwrap();
	assert_eq!(value["type"], "DONATION");
	assert_eq!(value["body"]["type"], "balloon");
	assert_eq!(value["body"]["fanJoinOrder"], 3);
	assert_eq!(value["body"]["imgUrl"], "balloon_100");
	assert_eq!(value["body"]["profile"]["badges"], json!([]));
}

#[test]
fn failure_reply_carries_only_success_flag() {
	let text = encode_reply(&Reply::failure(MessageType::Join)).unwrap();
	assert_eq!(text, r#"{"type":"JOIN","success":false}"#);
}

#[test]
fn chlist_request_ignores_body() {
	let req = decode_request(r#"{"type":"CHLIST","body":{"anything":1}}"#, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
	assert_eq!(req, Request::ChannelList);
}

#[test]
fn join_with_non_array_channel_ids_is_malformed() {
	let err = decode_request(r#"{"type":"JOIN","body":{"channelIds":"c1"}}"#, DEFAULT_MAX_MESSAGE_SIZE).unwrap_err();
	assert!(matches!(err, ProtocolError::Malformed(_)), "{err:?}");
}

#[test]
fn non_object_payloads_are_malformed() {
	assert!(matches!(
		decode_request("[1,2,3]", DEFAULT_MAX_MESSAGE_SIZE),
		Err(ProtocolError::Malformed(_))
	));
	assert!(matches!(
		decode_request("not json", DEFAULT_MAX_MESSAGE_SIZE),
		Err(ProtocolError::Json(_))
	));
}

proptest! {
	#[test]
	fn decode_never_panics_on_arbitrary_text(text in ".{0,256}") {
		let _ = decode_request(&text, DEFAULT_MAX_MESSAGE_SIZE);
	}

	#[test]
	fn join_ids_survive_decoding(ids in proptest::collection::vec("[a-z0-9]{1,12}", 0..8)) {
		let text = serde_json::to_string(&json!({"type": "JOIN", "body": {"channelIds": ids}})).unwrap();
		let req = decode_request(&text, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
		let expected: Vec<ChannelRef> = ids.into_iter().map(ChannelRef::from).collect();
		prop_assert_eq!(req, Request::Join { channel_ids: expected });
	}
}
