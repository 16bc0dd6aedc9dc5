// Client-to-server command encoding.
use bytes::{BufMut, Bytes, BytesMut};

use crate::MessageId;

/// A command sent to the server.
///
/// Commands are an ascii verb line terminated by `\n`; body-carrying
/// commands append a 32-bit big-endian length and the body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Feature-negotiation handshake; the body is a JSON object.
    Identify(Bytes),
    /// Authentication secret, sent when the server demands auth.
    Auth(Bytes),
    Subscribe { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Requeue { id: MessageId, delay_ms: u64 },
    Touch(MessageId),
    Cls,
    Nop,
    Publish { topic: String, body: Bytes },
    MultiPublish { topic: String, bodies: Vec<Bytes> },
    DeferredPublish {
        topic: String,
        delay_ms: u64,
        body: Bytes,
    },
}

impl Command {
    /// Verb for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Auth(_) => "AUTH",
            Command::Subscribe { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Requeue { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
            Command::Publish { .. } => "PUB",
            Command::MultiPublish { .. } => "MPUB",
            Command::DeferredPublish { .. } => "DPUB",
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Command::Identify(body) => encode_with_body(buf, b"IDENTIFY", &[], body),
            Command::Auth(secret) => encode_with_body(buf, b"AUTH", &[], secret),
            Command::Subscribe { topic, channel } => {
                encode_line(buf, b"SUB", &[topic.as_bytes(), channel.as_bytes()])
            }
            Command::Rdy(count) => {
                encode_line(buf, b"RDY", &[count.to_string().as_bytes()])
            }
            Command::Fin(id) => encode_line(buf, b"FIN", &[id.as_bytes()]),
            Command::Requeue { id, delay_ms } => {
                encode_line(buf, b"REQ", &[id.as_bytes(), delay_ms.to_string().as_bytes()])
            }
            Command::Touch(id) => encode_line(buf, b"TOUCH", &[id.as_bytes()]),
            Command::Cls => encode_line(buf, b"CLS", &[]),
            Command::Nop => encode_line(buf, b"NOP", &[]),
            Command::Publish { topic, body } => {
                encode_with_body(buf, b"PUB", &[topic.as_bytes()], body)
            }
            Command::MultiPublish { topic, bodies } => {
                // MPUB's body is a count followed by length-prefixed bodies.
                let total: usize = bodies.iter().map(|b| 4 + b.len()).sum();
                let mut body = BytesMut::with_capacity(4 + total);
                body.put_u32(bodies.len() as u32);
                for b in bodies {
                    body.put_u32(b.len() as u32);
                    body.extend_from_slice(b);
                }
                encode_with_body(buf, b"MPUB", &[topic.as_bytes()], &body.freeze());
            }
            Command::DeferredPublish {
                topic,
                delay_ms,
                body,
            } => encode_with_body(
                buf,
                b"DPUB",
                &[topic.as_bytes(), delay_ms.to_string().as_bytes()],
                body,
            ),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

fn encode_line(buf: &mut BytesMut, verb: &[u8], params: &[&[u8]]) {
    buf.extend_from_slice(verb);
    for param in params {
        buf.put_u8(b' ');
        buf.extend_from_slice(param);
    }
    buf.put_u8(b'\n');
}

fn encode_with_body(buf: &mut BytesMut, verb: &[u8], params: &[&[u8]], body: &Bytes) {
    encode_line(buf, verb, params);
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(bytes: &[u8]) -> MessageId {
        MessageId::from_bytes(bytes).expect("id")
    }

    #[test]
    fn line_commands_encode_as_ascii() {
        let cases: Vec<(Command, &[u8])> = vec![
            (
                Command::Subscribe {
                    topic: "clicks".into(),
                    channel: "archive".into(),
                },
                b"SUB clicks archive\n",
            ),
            (Command::Rdy(25), b"RDY 25\n"),
            (Command::Fin(id(b"0123456789abcdef")), b"FIN 0123456789abcdef\n"),
            (
                Command::Requeue {
                    id: id(b"0123456789abcdef"),
                    delay_ms: 5000,
                },
                b"REQ 0123456789abcdef 5000\n",
            ),
            (
                Command::Touch(id(b"0123456789abcdef")),
                b"TOUCH 0123456789abcdef\n",
            ),
            (Command::Cls, b"CLS\n"),
            (Command::Nop, b"NOP\n"),
        ];
        for (command, expected) in cases {
            assert_eq!(command.to_bytes().as_ref(), expected, "{}", command.name());
        }
    }

    #[test]
    fn identify_appends_length_prefixed_body() {
        let body = Bytes::from_static(br#"{"feature_negotiation":true}"#);
        let encoded = Command::Identify(body.clone()).to_bytes();
        let mut expected = BytesMut::new();
        expected.extend_from_slice(b"IDENTIFY\n");
        expected.put_u32(body.len() as u32);
        expected.extend_from_slice(&body);
        assert_eq!(encoded.as_ref(), expected.as_ref());
    }

    #[test]
    fn pub_carries_topic_and_body() {
        let encoded = Command::Publish {
            topic: "clicks".into(),
            body: Bytes::from_static(b"hello"),
        }
        .to_bytes();
        assert_eq!(&encoded[..11], b"PUB clicks\n");
        assert_eq!(&encoded[11..15], &5u32.to_be_bytes());
        assert_eq!(&encoded[15..], b"hello");
    }

    #[test]
    fn mpub_frames_each_body() {
        let encoded = Command::MultiPublish {
            topic: "clicks".into(),
            bodies: vec![Bytes::from_static(b"aa"), Bytes::from_static(b"b")],
        }
        .to_bytes();
        let mut expected = BytesMut::new();
        expected.extend_from_slice(b"MPUB clicks\n");
        expected.put_u32(4 + 6 + 5); // count word + two length-prefixed bodies
        expected.put_u32(2);
        expected.put_u32(2);
        expected.extend_from_slice(b"aa");
        expected.put_u32(1);
        expected.extend_from_slice(b"b");
        assert_eq!(encoded.as_ref(), expected.as_ref());
    }

    #[test]
    fn dpub_places_delay_before_body() {
        let encoded = Command::DeferredPublish {
            topic: "clicks".into(),
            delay_ms: 60_000,
            body: Bytes::from_static(b"later"),
        }
        .to_bytes();
        assert_eq!(&encoded[..18], b"DPUB clicks 60000\n");
        assert_eq!(&encoded[18..22], &5u32.to_be_bytes());
        assert_eq!(&encoded[22..], b"later");
    }
}
