use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use skybus::{
    parse_url, Args, Bus, BusConfig, BusError, Endpoint, HandlerError, HostedObject,
    ResourceRegistry,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "7666";
const SLEW_RATE_DEG_PER_SEC: f64 = 30.0;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("skybus")
        .version("0.1.0")
        .author("Observatory Control Software Team")
        .about("🔭 Observatory bus - call and monitor hosted instruments")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON file with bus settings")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("serve")
                .about("🛰️  Run a bus hosting a demo telescope")
                .arg(
                    Arg::with_name("host")
                        .short("h")
                        .long("host")
                        .value_name("HOST")
                        .takes_value(true)
                        .default_value(DEFAULT_HOST),
                )
                .arg(
                    Arg::with_name("port")
                        .short("p")
                        .long("port")
                        .value_name("PORT")
                        .takes_value(true)
                        .default_value(DEFAULT_PORT)
                        .validator(|v| match v.parse::<u16>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Port must be a number between 0 and 65535".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("ping")
                .about("🏓 Check whether the bus hosting an object answers")
                .arg(Arg::with_name("url").help("Object url, e.g. tcp://127.0.0.1:7666/Telescope/0").required(true)),
        )
        .subcommand(
            SubCommand::with_name("call")
                .about("📞 Call a method on a hosted object")
                .arg(Arg::with_name("url").help("Object url").required(true))
                .arg(Arg::with_name("method").help("Method name").required(true))
                .arg(
                    Arg::with_name("args")
                        .help("Positional arguments (JSON, bare words are strings)")
                        .multiple(true),
                )
                .arg(
                    Arg::with_name("timeout")
                        .short("t")
                        .long("timeout")
                        .value_name("SECONDS")
                        .takes_value(true),
                ),
        )
        .get_matches();

    init_logging(matches.is_present("verbose"));

    let config = match matches.value_of("config") {
        Some(path) => BusConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => BusConfig::default(),
    };

    match matches.subcommand() {
        ("serve", Some(sub_matches)) => handle_serve(sub_matches, config).await?,
        ("ping", Some(sub_matches)) => handle_ping(sub_matches, config).await?,
        ("call", Some(sub_matches)) => handle_call(sub_matches, config).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Host a demo telescope", "skybus serve".bright_cyan());
            println!("  {} Check it answers", "skybus ping tcp://127.0.0.1:7666/Telescope/0".bright_cyan());
            println!("  {} Read its azimuth", "skybus call tcp://127.0.0.1:7666/Telescope/0 get_az".bright_cyan());
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("skybus=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Client-side bus: calls never need our own broker, so the port is unused.
fn client_bus(config: BusConfig) -> Bus {
    Bus::new(Endpoint::new(DEFAULT_HOST, 0), config)
}

fn demo_telescope(bus: Weak<Bus>, url: skybus::Url) -> HostedObject {
    let az = Arc::new(Mutex::new(0.0_f64));
    let read_az = Arc::clone(&az);

    HostedObject::new()
        .with_base("Instrument")
        .method("get_az", move |_: &Args| Ok(json!(*read_az.lock())))
        .method("slew", move |args: &Args| {
            let target: f64 = args.arg(0)?;
            if !(0.0..360.0).contains(&target) {
                return Err(HandlerError::new(
                    "ValueError",
                    format!("azimuth {} outside [0, 360)", target),
                ));
            }

            let distance = (target - *az.lock()).abs();
            let runtime = tokio::runtime::Handle::current();
            let announce = |event: &str, value: f64| {
                if let Some(bus) = bus.upgrade() {
                    let event_args = Args::positional(vec![json!(value)]);
                    if let Err(e) = runtime.block_on(bus.publish(&url, event, event_args)) {
                        error!(event, error = %e, "failed to publish");
                    }
                }
            };

            announce("slew_begin", target);
            std::thread::sleep(Duration::from_secs_f64(distance / SLEW_RATE_DEG_PER_SEC));
            *az.lock() = target;
            announce("slew_complete", target);
            Ok(json!(target))
        })
}

async fn handle_serve(matches: &ArgMatches<'_>, config: BusConfig) -> Result<(), Box<dyn std::error::Error>> {
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;

    let bus = Arc::new(Bus::new(Endpoint::new(host, port), config));
    let registry = Arc::new(ResourceRegistry::new());
    let telescope = bus.object_url("Telescope", Some("main"))?;
    registry.add(&telescope.path(), demo_telescope(Arc::downgrade(&bus), telescope.clone()))?;
    bus.set_resolver(registry);

    if let Err(e) = bus.bind().await {
        println!("{} {}", "❌".red(), format!("Cannot serve {}: {}", bus.endpoint(), e).bright_red());
        return Err(e.into());
    }

    println!("{}", "🔭 skybus".bright_blue().bold());
    println!("{} {}", "Serving".dimmed(), bus.endpoint());
    println!("{} {}", "Hosting".dimmed(), telescope);

    let server = Arc::clone(&bus);
    let serving = tokio::spawn(async move { server.run_forever().await });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    bus.shutdown().await;
    serving.await??;

    println!("{}", "Bus closed".bright_green());
    Ok(())
}

async fn handle_ping(matches: &ArgMatches<'_>, config: BusConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dst = parse_url(matches.value_of("url").unwrap_or_default())?;
    let bus = client_bus(config);
    let src = bus.object_url("Cli", None)?;

    let result = bus.ping(&src, &dst).await;
    bus.shutdown().await;

    match result {
        Some(_) => println!("{} {}", "✅".green(), format!("{} is responsive", dst.endpoint()).bright_green()),
        None => println!("{} {}", "❌".red(), format!("{} did not answer", dst.endpoint()).bright_red()),
    }
    Ok(())
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn handle_call(matches: &ArgMatches<'_>, config: BusConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dst = parse_url(matches.value_of("url").unwrap_or_default())?;
    let method = matches.value_of("method").unwrap_or_default();
    let args: Vec<Value> = matches
        .values_of("args")
        .map(|values| values.map(parse_arg).collect())
        .unwrap_or_default();
    let timeout = match matches.value_of("timeout") {
        Some(seconds) => Some(Duration::from_secs_f64(seconds.parse::<f64>()?)),
        None => None,
    };

    let bus = client_bus(config);
    let src = bus.object_url("Cli", None)?;
    let result = bus
        .request(&src, &dst, method, Args::positional(args), timeout)
        .await
        .and_then(|response| {
            let not_found = response.is_not_found();
            response.into_result().map_err(|e| {
                if not_found {
                    BusError::NotFound(e.message)
                } else {
                    BusError::Remote(e)
                }
            })
        });
    bus.shutdown().await;

    match result {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?.bright_green()),
        Err(BusError::Remote(e)) => {
            println!("{} {}", "❌".red(), format!("{}: {}", e.kind, e.message).bright_red());
            if let Some(traceback) = e.traceback {
                println!("{}", traceback.dimmed());
            }
        }
        Err(e) if e.is_timeout() => println!("{} {}", "⏱️".yellow(), e.to_string().yellow()),
        Err(e) => println!("{} {}", "❌".red(), e.to_string().bright_red()),
    }
    Ok(())
}
