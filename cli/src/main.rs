//! `rdsctl`: a thin operator debug CLI that dials the CSI plugin's unix
//! domain socket and issues a handful of read-only Identity/Controller/Node
//! RPCs. Not part of the CSI contract itself — a troubleshooting aid for
//! whoever is poking at a running plugin pod.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing_subscriber::EnvFilter;

use csi::csi::controller_client::ControllerClient;
use csi::csi::identity_client::IdentityClient;
use csi::csi::node_client::NodeClient;
use csi::csi::{
    ControllerGetCapabilitiesRequest, GetPluginCapabilitiesRequest, GetPluginInfoRequest, NodeGetCapabilitiesRequest,
    NodeGetInfoRequest, ProbeRequest,
};

#[derive(Parser, Debug)]
#[command(name = "rdsctl", version)]
struct Cli {
    /// Path to the plugin's unix domain socket.
    #[arg(long, env = "RDS_CSI_SOCKET", default_value = "/var/lib/kubelet/plugins/rds.csi/csi.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query driver name and version.
    Info,
    /// Report readiness (Identity/Probe).
    Probe,
    /// List advertised plugin capabilities.
    Capabilities,
    /// Print this node's CSI node ID and topology (Node/NodeGetInfo).
    NodeInfo,
}

async fn socket_channel(path: &Path) -> anyhow::Result<Channel> {
    let p = path.to_owned();
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            let p = p.clone();
            async move { UnixStream::connect(p).await }
        }))
        .await?;
    Ok(channel)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let channel = socket_channel(&cli.socket).await?;

    match cli.command {
        Command::Info => {
            let mut client = IdentityClient::new(channel);
            let info = client.get_plugin_info(GetPluginInfoRequest {}).await?.into_inner();
            println!("{} {}", info.name, info.vendor_version);
        }
        Command::Probe => {
            let mut client = IdentityClient::new(channel);
            let ready = client.probe(ProbeRequest {}).await?.into_inner().ready;
            println!("ready: {ready}");
            if !ready {
                std::process::exit(1);
            }
        }
        Command::Capabilities => {
            let mut identity = IdentityClient::new(channel.clone());
            let caps = identity
                .get_plugin_capabilities(GetPluginCapabilitiesRequest {})
                .await?
                .into_inner();
            println!("identity: {:?}", caps.capabilities);

            if let Ok(resp) = ControllerClient::new(channel.clone())
                .controller_get_capabilities(ControllerGetCapabilitiesRequest {})
                .await
            {
                println!("controller: {:?}", resp.into_inner().capabilities);
            }
            if let Ok(resp) = NodeClient::new(channel)
                .node_get_capabilities(NodeGetCapabilitiesRequest {})
                .await
            {
                println!("node: {:?}", resp.into_inner().capabilities);
            }
        }
        Command::NodeInfo => {
            let mut client = NodeClient::new(channel);
            let info = client.node_get_info(NodeGetInfoRequest {}).await?.into_inner();
            println!("node_id: {}", info.node_id);
            println!("max_volumes_per_node: {}", info.max_volumes_per_node);
            if let Some(topology) = info.accessible_topology {
                for (k, v) in topology.segments {
                    println!("topology: {k}={v}");
                }
            }
        }
    }

    Ok(())
}
