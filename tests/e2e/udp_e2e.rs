use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use orvibo::config::ClientConfig;
use orvibo::e2e_common::SimulatedSocket;
use orvibo::messages::{DeviceAddress, PowerState};
use orvibo::OrviboClient;

/// Serves one simulated socket on a loopback UDP port.
async fn spawn_device(
    socket: Arc<SimulatedSocket>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn Error>> {
    let udp = UdpSocket::bind(("127.0.0.1", 0)).await?;
    let addr = udp.local_addr()?;
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((len, from)) = udp.recv_from(&mut buf).await {
            if let Some(reply) = socket.respond(&buf[..len]) {
                let _ = udp.send_to(&reply, from).await;
            }
        }
    });
    Ok((addr, handle))
}

#[tokio::test]
async fn change_power_state_over_loopback_udp() -> Result<(), Box<dyn Error>> {
    let target = DeviceAddress::parse("127.0.0.1", "ACCF23A1B2C3")?;
    let socket = Arc::new(SimulatedSocket::new(target, PowerState::Off).ignoring_first(1));
    let (device_addr, device_task) = spawn_device(socket.clone()).await?;

    let config = ClientConfig::default()
        .with_local_addr("127.0.0.1:0".parse()?)
        .with_device_port(device_addr.port())
        .with_request_timeout(Duration::from_secs(3));
    let client = OrviboClient::bind(config).await?;

    assert_eq!(client.get_power_state(&target).await?, PowerState::Off);
    assert_eq!(
        client.change_power_state(&target, PowerState::On).await?,
        PowerState::On
    );
    assert_eq!(socket.state(), PowerState::On);
    assert_eq!(client.dispatcher().pending_len(), 0);

    client.close().await;
    device_task.abort();
    Ok(())
}

#[tokio::test]
async fn unreachable_device_times_out() -> Result<(), Box<dyn Error>> {
    let silent = UdpSocket::bind(("127.0.0.1", 0)).await?;
    let config = ClientConfig::default()
        .with_local_addr("127.0.0.1:0".parse()?)
        .with_device_port(silent.local_addr()?.port())
        .with_resend_interval(Duration::from_millis(50))
        .with_request_timeout(Duration::from_millis(300));
    let client = OrviboClient::bind(config).await?;

    let target = DeviceAddress::parse("127.0.0.1", "ACCF23A1B2C3")?;
    let err = client.subscribe(&target).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(client.dispatcher().pending_len(), 0);
    Ok(())
}
