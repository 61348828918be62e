/// Device pool demo
///
/// Connects a Modbus TCP device through the pool, reads a holding
/// register, then leaves the heartbeat supervisor running for a while so
/// lifecycle events can be observed (try stopping and restarting your
/// slave while it runs).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use modpool::{codec, DeviceConfig, Framing, ModbusClient, ModbusDevice, ModbusFunction, ModbusResult};

#[tokio::main]
async fn main() -> ModbusResult<()> {
    env_logger::init();

    let (host, port) = parse_target(std::env::args().nth(1));
    println!("modpool demo - target {}:{}", host, port);

    let client = ModbusClient::new();
    client.subscribe(Arc::new(|event| {
        println!("[event] {} {} at {}", event.kind, event.device_id, event.timestamp);
    }));

    let config = DeviceConfig::tcp(host, port).with_timeout(Duration::from_secs(2));
    let device = match client.connect_device(config).await {
        Ok(device) => device,
        Err(e) => {
            eprintln!("connect failed: {}", e);
            eprintln!("is a Modbus slave listening on the target address?");
            return Ok(());
        }
    };
    println!("connected: {}", device.device_id());

    match device.send(1, ModbusFunction::ReadHoldingRegisters.to_u8(), 0, 2).await {
        Ok(response) => {
            println!("raw response: {:02X?}", response);
            let values = codec::pdu::from_response(Framing::Mbap, &response)
                .and_then(codec::pdu::registers);
            match values {
                Ok(values) => println!("holding registers 0-1: {:?}", values),
                Err(e) => eprintln!("response did not decode: {}", e),
            }
        }
        Err(e) => eprintln!("read failed: {}", e),
    }

    client.mark_persistent(&device.device_id()).await;
    client.start_heartbeat(Duration::from_secs(2));
    println!("heartbeat running for 30s, watching {}", device.device_id());
    sleep(Duration::from_secs(30)).await;

    client.shutdown().await;
    println!("pool shut down");
    Ok(())
}

fn parse_target(arg: Option<String>) -> (String, u16) {
    let target = arg.unwrap_or_else(|| format!("127.0.0.1:{}", modpool::DEFAULT_TCP_PORT));
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().unwrap_or(modpool::DEFAULT_TCP_PORT);
            (host.to_string(), port)
        }
        None => (target, modpool::DEFAULT_TCP_PORT),
    }
}
