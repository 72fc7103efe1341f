// Tests for the outbound frame pump

mod common;

use anyhow::Result;
use base64::Engine;
use common::frame;
use loqa_duplex::session::OutboundFramePump;
use loqa_duplex::transport::{
    AgentSession, Connector, MemoryConnector, MemoryTransportConfig, SessionSetup, TransportLink,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn setup() -> SessionSetup {
    SessionSetup {
        session_id: "pump-test".to_string(),
        persona: "tester".to_string(),
        voice: "Puck".to_string(),
        excerpt: None,
        input_mime_type: "audio/pcm;rate=16000".to_string(),
        output_sample_rate: 24000,
    }
}

async fn open_link(config: MemoryTransportConfig) -> Result<(Arc<dyn TransportLink>, AgentSession)> {
    let (connector, mut endpoint) = MemoryConnector::new(config);
    let connection = connector.connect(setup()).await?;
    let agent = endpoint.accept().await.expect("agent session");
    Ok((connection.link, agent))
}

#[test]
fn test_frames_dropped_before_transport_opens() {
    let pump = OutboundFramePump::new(8);

    for i in 0..5 {
        pump.submit(frame(i, 0.1, 160));
    }

    let stats = pump.stats();
    assert!(!pump.is_open());
    assert_eq!(stats.captured, 5);
    assert_eq!(stats.dropped, 5);
    assert_eq!(stats.sent, 0);
}

#[tokio::test]
async fn test_frames_sent_in_capture_order() -> Result<()> {
    let (link, mut agent) = open_link(MemoryTransportConfig::default()).await?;
    let pump = OutboundFramePump::new(64);
    pump.attach(link)?;

    for i in 0..20u64 {
        pump.submit(frame(i, i as f32 / 100.0, 4));
    }

    for i in 0..20u64 {
        let sent = agent.outbound.recv().await.expect("frame");
        assert_eq!(sent.mime_type, "audio/pcm;rate=16000");

        let bytes = base64::engine::general_purpose::STANDARD.decode(&sent.data_base64)?;
        let first = i16::from_le_bytes([bytes[0], bytes[1]]);
        let expected = (i as f32 / 100.0 * 32767.0).round() as i16;
        assert_eq!(first, expected, "frame {} out of order", i);
    }

    assert_eq!(pump.stats().sent, 20);
    Ok(())
}

#[tokio::test]
async fn test_submit_never_waits_for_slow_transport() -> Result<()> {
    let (link, _agent) = open_link(MemoryTransportConfig {
        send_latency: Duration::from_secs(3600),
        ..Default::default()
    })
    .await?;

    let pump = OutboundFramePump::new(4);
    pump.attach(link)?;

    let started = Instant::now();
    for i in 0..1000 {
        pump.submit(frame(i, 0.2, 4096));
    }
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(2), "submit stalled for {:?}", elapsed);

    let stats = pump.stats();
    assert_eq!(stats.captured, 1000);
    assert!(stats.dropped >= 995, "dropped {}", stats.dropped);
    assert_eq!(stats.sent, 0);
    Ok(())
}

#[tokio::test]
async fn test_close_stops_sending() -> Result<()> {
    let (link, mut agent) = open_link(MemoryTransportConfig::default()).await?;
    let pump = OutboundFramePump::new(8);
    pump.attach(link)?;

    pump.submit(frame(0, 0.3, 4));
    assert!(agent.outbound.recv().await.is_some());

    pump.close();
    pump.submit(frame(1, 0.3, 4));

    assert!(!pump.is_open());
    assert_eq!(pump.stats().dropped, 1);
    assert_eq!(pump.stats().sent, 1);
    Ok(())
}

#[tokio::test]
async fn test_attach_twice_fails() -> Result<()> {
    let (link, _agent) = open_link(MemoryTransportConfig::default()).await?;
    let pump = OutboundFramePump::new(8);

    pump.attach(link.clone())?;
    assert!(pump.attach(link).is_err());
    Ok(())
}
