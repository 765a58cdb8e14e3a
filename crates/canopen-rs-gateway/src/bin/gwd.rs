//! `gwd` - minimal CiA 309-5 gateway daemon.
//!
//! Usage: `gwd [CAN_INTERFACE] [BIND_ADDR] [DEFAULT_NODE]`
//! (defaults: can0, 127.0.0.1:8085, no default node)

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() {
    use canopen_rs::{BusManager, Network};
    use canopen_rs_gateway::{Executor, router};
    use canopen_rs_linux::{RxPump, SocketCanInterface};
    use std::sync::Arc;

    env_logger::init();

    let mut args = std::env::args().skip(1);
    let interface = args.next().unwrap_or_else(|| "can0".to_string());
    let bind_addr = args.next().unwrap_or_else(|| "127.0.0.1:8085".to_string());
    let default_node = args.next().and_then(|s| s.parse::<u8>().ok());

    let bus = Arc::new(BusManager::new(Box::new(SocketCanInterface::new(
        &interface,
    ))));
    let _pump = match RxPump::start(&interface, bus.clone()) {
        Ok(pump) => pump,
        Err(e) => {
            eprintln!("cannot open CAN interface {}: {}", interface, e);
            std::process::exit(1);
        }
    };

    let network = Arc::new(Network::new(bus));
    if let Err(e) = Network::connect(&network) {
        eprintln!("cannot connect to {}: {}", interface, e);
        std::process::exit(1);
    }

    let app = router(Executor::spawn(network), default_node);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("cannot bind {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };
    log::info!("CiA 309-5 gateway listening on http://{}", bind_addr);

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("gateway server error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("gwd requires SocketCAN and only runs on Linux");
    std::process::exit(1);
}
