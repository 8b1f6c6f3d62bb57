use std::net::{IpAddr, Ipv4Addr};
use std::thread;
use std::time::Duration;

use taskio::config::RuntimeConfig;
use taskio::router::Router;
use taskio::Runtime;

fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut router = Router::new();
    router.route(
        "/api/*",
        Box::new(|_req, resp| {
            resp.set_body("{\"status\":\"ok\"}");
            resp.add_header("Content-Type", "application/json");
            Ok(())
        }),
    );

    let mut config = RuntimeConfig::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    config.listen_port = 8080;
    config.routes = router;
    config.max_connections = 4096;

    let runtime = Runtime::start(config)?;
    log::info!("listening on 127.0.0.1:8080");

    loop {
        thread::sleep(Duration::from_secs(60));
        log::debug!("{} live sessions", runtime.live_sessions());
    }
}
