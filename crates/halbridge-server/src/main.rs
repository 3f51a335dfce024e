use std::process;

use halbridge::HALBRIDGE_VERSION;
use halbridge::bridge::protocol::InitConfig;
use halbridge::config::ServerConfig;
use halbridge::devices::{
    CameraControl, EchoHandler, ParameterStoreHandler, RemoteCameraHandler, SimulatedCamera,
};
use halbridge::handler::RemoteHandler;
use halbridge::server::RemoteBridge;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Device {
    Echo,
    Parameters,
    Camera,
}

#[derive(Debug)]
struct Args {
    remote: Option<String>,
    local: Option<String>,
    device: Device,
    name: String,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: halbridge-server [--remote <addr>] [--local <addr>] [--device <kind>] [--name <module>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --remote <addr>   Request endpoint [default: $HALBRIDGE_REMOTE_ADDRESS or tcp://*:5556]");
            eprintln!("  --local <addr>    Notify endpoint [default: $HALBRIDGE_LOCAL_ADDRESS or tcp://*:5557]");
            eprintln!("  --device <kind>   echo, parameters or camera [default: echo]");
            eprintln!("  --name <module>   Module name for the parameter store [default: remote]");
            process::exit(2);
        }
    };

    halbridge::logging::init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "halbridge-server failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut remote = None;
    let mut local = None;
    let mut device = Device::Echo;
    let mut name = "remote".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--remote" | "-r" => {
                i += 1;
                remote = Some(args.get(i).ok_or("--remote requires a value")?.clone());
            }
            "--local" | "-l" => {
                i += 1;
                local = Some(args.get(i).ok_or("--local requires a value")?.clone());
            }
            "--device" => {
                i += 1;
                device = match args.get(i).ok_or("--device requires a value")?.as_str() {
                    "echo" | "none" => Device::Echo,
                    "parameters" => Device::Parameters,
                    "camera" => Device::Camera,
                    other => {
                        return Err(format!(
                            "invalid device '{other}', expected 'echo', 'parameters' or 'camera'"
                        ));
                    }
                };
            }
            "--name" => {
                i += 1;
                name = args.get(i).ok_or("--name requires a value")?.clone();
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Args {
        remote,
        local,
        device,
        name,
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env()?;
    if let Some(remote) = &args.remote {
        config.request_endpoint = remote.parse()?;
    }
    if let Some(local) = &args.local {
        config.notify_endpoint = local.parse()?;
    }

    tracing::info!(
        version = HALBRIDGE_VERSION,
        device = ?args.device,
        remote = %config.request_endpoint,
        local = %config.notify_endpoint,
        "Starting halbridge-server"
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted, shutting down");
                signal_cancel.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Unable to listen for ctrl-c"),
        }
    });

    match args.device {
        Device::Echo => serve(config, EchoHandler, cancel).await,
        Device::Parameters => {
            serve(config, ParameterStoreHandler::new(args.name, Default::default()), cancel).await
        }
        Device::Camera => {
            let handler = RemoteCameraHandler::new(Box::new(|init: &InitConfig| {
                Ok(Box::new(SimulatedCamera::from_init(init)) as Box<dyn CameraControl>)
            }));
            serve(config, handler, cancel).await
        }
    }
}

async fn serve<H: RemoteHandler>(
    config: ServerConfig,
    handler: H,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut bridge = RemoteBridge::new(config, handler);
    bridge.serve(cancel).await?;
    tracing::info!("halbridge-server stopped");
    Ok(())
}
