//! Connect with a TOML config, ping the server once, and disconnect.
//!
//! Usage: `waddle-xmpp-probe [config.toml]` (defaults to `xmpp.toml`).

use minidom::Element;
use tracing::{error, info};
use waddle_xmpp_client::{Connection, Iq, Jid, Presence, XmppError, load_config_from};

const PING_NS: &str = "urn:xmpp:ping";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,waddle_xmpp_client=debug"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(path: &str) -> Result<(), XmppError> {
    let config = load_config_from(path)?;
    let mut connection = Connection::new(config)?;
    connection.connect().await?;

    let bound = connection.bound_jid().cloned();
    info!(jid = ?bound.as_ref().map(Jid::to_string), "Session ready");

    connection.send(Presence::available()).await?;

    let mut ping = Iq::get(Element::builder("ping", PING_NS).build());
    if let Some(jid) = &bound {
        ping = ping.with_to(Jid::parse(jid.host())?);
    }
    match connection.request(ping).await {
        Ok(reply) => info!(id = ?reply.id(), kind = %reply.kind(), "Ping answered"),
        Err(e) => error!(error = %e, "Ping failed"),
    }

    connection.disconnect().await
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "xmpp.toml".to_string());

    match run(&path).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Probe failed");
            std::process::ExitCode::FAILURE
        }
    }
}
