// Connection bootstrap: magic, IDENTIFY negotiation, stream upgrades,
// AUTH, and subscription.
use bytes::Bytes;
use nsq_transport::Compression;
use nsq_wire::{Command, Frame, FrameType, OK};
use tracing::{debug, info, warn};

use crate::config::{AuthResponse, Config, IdentifyResponse};
use crate::conn::io::ConnIo;
use crate::error::{Error, Result};

pub(crate) struct Negotiated {
    pub(crate) io: ConnIo,
    pub(crate) identify: IdentifyResponse,
}

pub(crate) async fn establish(
    addr: &str,
    config: &Config,
    subscription: Option<&(String, String)>,
) -> Result<Negotiated> {
    let stream = nsq_transport::dial(addr, config.dial_timeout).await?;
    let mut io = ConnIo::new(stream, config.max_frame_bytes);

    io.write_all(nsq_wire::MAGIC_V2).await?;
    io.send_command(&Command::Identify(config.identify_payload()?))
        .await?;

    let frame = read_response(&mut io).await?;
    let identify = if frame.payload.as_ref() == OK {
        // Pre-0.2.20 brokers do not speak feature negotiation.
        warn!(addr, "broker does not support feature negotiation");
        IdentifyResponse::legacy()
    } else {
        serde_json::from_slice::<IdentifyResponse>(&frame.payload)
            .map_err(|e| Error::integrity("IDENTIFY response", e.to_string()))?
    };
    debug!(addr, version = %identify.version, max_rdy_count = identify.max_rdy_count(), "negotiated");

    if config.tls_v1 && !identify.tls_v1 {
        warn!(addr, "tls_v1 requested but the broker disabled it");
    }
    if config.snappy && !identify.snappy {
        warn!(addr, "snappy requested but the broker disabled it");
    }
    if config.deflate && !identify.deflate {
        warn!(addr, "deflate requested but the broker disabled it");
    }

    // Transforms stack outward in a fixed order: TLS first, then one of the
    // two compressors. Each upgrade is confirmed with an OK frame read
    // through the newly layered stream.
    if config.tls_v1 && identify.tls_v1 {
        io.upgrade_tls(addr, &config.tls_options).await?;
        expect_ok(read_response(&mut io).await?, "TLS upgrade")?;
    }
    if config.snappy && identify.snappy {
        io.enable_compression(Compression::Snappy)?;
        expect_ok(read_response(&mut io).await?, "snappy upgrade")?;
    } else if config.deflate && identify.deflate {
        io.enable_compression(Compression::Deflate {
            level: config.deflate_level,
        })?;
        expect_ok(read_response(&mut io).await?, "deflate upgrade")?;
    }

    if identify.auth_required {
        let secret = config.auth_secret.as_deref().ok_or(Error::AuthRequired)?;
        io.send_command(&Command::Auth(Bytes::copy_from_slice(secret.as_bytes())))
            .await?;
        let frame = read_response(&mut io).await?;
        let auth = serde_json::from_slice::<AuthResponse>(&frame.payload)
            .map_err(|e| Error::integrity("AUTH response", e.to_string()))?;
        info!(
            addr,
            identity = %auth.identity,
            permission_count = auth.permission_count,
            "auth accepted"
        );
    }

    if let Some((topic, channel)) = subscription {
        io.send_command(&Command::Subscribe {
            topic: topic.clone(),
            channel: channel.clone(),
        })
        .await?;
        expect_ok(read_response(&mut io).await?, "SUB")?;
    }

    Ok(Negotiated { io, identify })
}

/// Read the next non-heartbeat frame, answering heartbeats along the way.
/// Error frames abort the handshake.
async fn read_response(io: &mut ConnIo) -> Result<Frame> {
    loop {
        let frame = io.read_frame().await?;
        if frame.is_heartbeat() {
            io.send_command(&Command::Nop).await?;
            continue;
        }
        if frame.frame_type == FrameType::Error {
            return Err(Error::Broker(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            ));
        }
        return Ok(frame);
    }
}

fn expect_ok(frame: Frame, context: &'static str) -> Result<()> {
    if frame.frame_type == FrameType::Response && frame.payload.as_ref() == OK {
        return Ok(());
    }
    Err(Error::integrity(
        context,
        format!(
            "expected OK, got {:?}",
            String::from_utf8_lossy(&frame.payload)
        ),
    ))
}
