// Huddle CLI: host or join LAN chat rooms, hand out and take job offers.

mod chat;
mod jobs;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut mode: Option<String> = None;
    let mut config_path: Option<std::path::PathBuf> = None;
    let mut name: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("huddle-cli {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--config" => {
                let path = args.next().ok_or("--config needs a path")?;
                config_path = Some(std::path::PathBuf::from(path));
            }
            "--name" => {
                name = Some(args.next().ok_or("--name needs a value")?);
            }
            other if !other.starts_with('-') && mode.is_none() => {
                mode = Some(other.to_string());
            }
            other => return Err(format!("unknown argument: {}", other).into()),
        }
    }

    let cfg = match &config_path {
        Some(path) => huddle_net::config::load_from(path)?,
        None => huddle_net::config::load(),
    };
    let name = name.unwrap_or_else(default_name);

    let rt = tokio::runtime::Runtime::new()?;
    match mode.as_deref() {
        Some("chat") => rt.block_on(chat::run(&name, cfg)),
        Some("jobs") => rt.block_on(jobs::run(&name, cfg)),
        Some(other) => Err(format!("unknown mode {:?}, expected chat or jobs", other).into()),
        None => {
            print_usage();
            Err("missing mode".into())
        }
    }
}

fn default_name() -> String {
    std::env::var("USER")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "huddle-user".to_string())
}

fn print_usage() {
    println!("usage: huddle-cli [--name NAME] [--config FILE] <chat|jobs>");
    println!();
    println!("  chat    host or join a LAN chat room");
    println!("  jobs    offer work to nearby employees, or take offers yourself");
    println!();
    println!("  --name NAME    display name shown to peers (default: $USER)");
    println!("  --config FILE  network settings, TOML");
    println!("  -V, --version  print version");
}
