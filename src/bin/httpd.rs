//! Demo HTTP server binary.

use std::path::PathBuf;

use clap::Parser;

use kiln::config::Config;
use kiln::event_loop::EventLoop;
use kiln::http::{HttpServer, Method, StatusCode};
use kiln::{logging, signal};

#[derive(Parser)]
#[command(name = "kiln-httpd")]
#[command(about = "Reactor-pattern HTTP server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load config: {}", err);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(err) = run(config) {
        eprintln!("server error: {}", err);
        std::process::exit(1);
    }
}

fn run(config: Config) -> kiln::Result<()> {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle().clone();

    let server = HttpServer::new(&handle, config.listen, config.name.clone(), config.reuse_port)?;
    server.set_thread_num(config.threads());
    server.set_tcp_nodelay(config.tcp_nodelay);
    server.tcp_server().set_high_water_mark_callback(
        |conn, queued| {
            tracing::warn!(conn = %conn.name(), queued, "output buffer past high-water mark");
        },
        config.high_water_mark,
    );

    server.set_http_callback(|request, response| match (request.method(), request.path()) {
        (Some(Method::Get), "/") => {
            response.set_status_code(StatusCode::Ok);
            response.set_status_message("OK");
            response.set_content_type("text/plain");
            response.set_body("kiln is running\n");
        }
        (Some(Method::Get), "/echo") => {
            response.set_status_code(StatusCode::Ok);
            response.set_status_message("OK");
            response.set_content_type("text/plain");
            response.set_body(
                request
                    .header("User-Agent")
                    .unwrap_or("unknown")
                    .to_string(),
            );
        }
        _ => {
            response.set_status_code(StatusCode::NotFound);
            response.set_status_message("Not Found");
            response.set_close_connection(true);
        }
    });

    let quit = handle.clone();
    signal::on_shutdown(move || quit.quit());

    server.start();
    event_loop.run();
    Ok(())
}

fn print_default_config() {
    let config = r#"# kiln-httpd configuration

# Server name used in connection names and logs
name = "kiln"

# Address to listen on
listen = "0.0.0.0:8080"

# Share the port across processes with SO_REUSEPORT
reuse_port = false

# Worker event-loop threads (default: number of CPUs; 0 = main loop only)
# worker_threads = 4

# Set TCP_NODELAY on accepted connections
tcp_nodelay = true

# Output-buffer backpressure threshold
high_water_mark = "64MB"

[logging]
# Log level filter (overridden by RUST_LOG)
level = "info"

# Output format: "pretty", "compact", or "json"
format = "pretty"

timestamps = true
thread_names = false
"#;
    print!("{}", config);
}
