use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use n0_error::{Result, StackResultExt, StdResultExt};
use tracing::info;
use wip_proxy::{
    BackendRule, CertificateAuthority, ConfigError, ConfigStore, FilePidRegistry, Proxy,
};

#[derive(Parser)]
#[command(name = "wip-proxy", version, about = "Local proxy for .wip development domains")]
struct Cli {
    /// Proxy home directory (defaults to ~/.symfony5).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy server.
    Start,
    /// Attach a backend under a basepath for the proxy.
    #[command(name = "proxy:backend:attach", alias = "proxy:backend:add")]
    BackendAttach {
        /// Domain the backend is scoped to; "*" matches every domain.
        #[arg(long, default_value = "*")]
        domain: String,
        /// Backend URL, complete with scheme, host, port and path.
        #[arg(long)]
        backend: String,
        /// Basepath mounted in the proxy and replaced with the backend.
        #[arg(long)]
        basepath: String,
    },
    /// Detach a backend from the proxy.
    #[command(name = "proxy:backend:detach", alias = "proxy:backend:remove")]
    BackendDetach {
        #[arg(long, default_value = "*")]
        domain: String,
        #[arg(long)]
        backend: String,
        #[arg(long)]
        basepath: String,
    },
    /// Link domains (without the TLD) to a project directory.
    #[command(name = "proxy:domain:attach")]
    DomainAttach {
        /// The project's domains.
        #[arg(required = true)]
        domains: Vec<String>,
        /// The project directory.
        #[arg(long)]
        dir: PathBuf,
    },
    /// Unlink domains from their project directory.
    #[command(name = "proxy:domain:detach")]
    DomainDetach {
        #[arg(required = true)]
        domains: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let home = match cli.home {
        Some(home) => home,
        None => default_home()?,
    };
    match cli.command {
        Command::Start => start(home).await,
        Command::BackendAttach {
            domain,
            backend,
            basepath,
        } => {
            let config = ConfigStore::load(&home).anyerr()?;
            config.append_backend(BackendRule::new(domain, basepath, backend));
            config.save().anyerr()?;
            println!("The proxy is now configured with the following backends:");
            let tld = config.tld();
            for rule in config.backends() {
                println!(" * {} -> {}", rule.prefix(&tld), rule.backend_base_url);
            }
            Ok(())
        }
        Command::BackendDetach {
            domain,
            backend,
            basepath,
        } => {
            let config = ConfigStore::load(&home).anyerr()?;
            let rule = BackendRule::new(domain, basepath, backend);
            match config.remove_backend(&rule) {
                Ok(()) => println!("Backend detached."),
                Err(ConfigError::BackendNotFound { .. }) => println!("nothing changed"),
                Err(err) => return Err(err).anyerr(),
            }
            // The file is rewritten even when nothing matched.
            config.save().anyerr()?;
            Ok(())
        }
        Command::DomainAttach { domains, dir } => {
            let config = ConfigStore::load(&home).anyerr()?;
            let dir = dir.to_string_lossy().to_string();
            config.add_dir_domains(&dir, &domains).anyerr()?;
            println!("The proxy is now configured with the following domains for this directory:");
            for domain in config.get_domains(&dir) {
                println!(" * http://{domain}");
            }
            Ok(())
        }
        Command::DomainDetach { domains } => {
            let config = ConfigStore::load(&home).anyerr()?;
            config.remove_dir_domains(&domains).anyerr()?;
            println!("Domains detached.");
            Ok(())
        }
    }
}

fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("unable to determine the home directory")?
        .join(".symfony5"))
}

async fn start(home: PathBuf) -> Result<()> {
    let config = Arc::new(ConfigStore::load(&home).anyerr()?);
    let registry = Arc::new(FilePidRegistry::new(&home));
    let certs_dir = home.join("certs");
    let ca = match CertificateAuthority::load(&certs_dir)? {
        Some(ca) => Arc::new(ca),
        None => {
            info!("no local CA found, generating one in {certs_dir:?}");
            Arc::new(CertificateAuthority::bootstrap(&certs_dir)?)
        }
    };
    let proxy = Arc::new(Proxy::new(config, registry, Some(ca)));
    tokio::select! {
        res = proxy.start() => res,
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}
