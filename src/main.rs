// Domain search indexer
//
// Keeps a search index continuously consistent with an authoritative
// relational store. For a configured domain, runs one of two modes:
// - listener: reacts to database change notifications with bounded-batch,
//   at-least-once propagation into the search collection
// - full: materialises the entire domain, or an override-requested time
//   window broken into day-sized sub-batches processed concurrently
//
// Architecture:
// - gateway:          pooled PostgreSQL connections, named stored procedures (C1)
// - normalize:         row batch -> index-document normalisation (C2)
// - index:             Solr upsert client (C3)
// - hooks:             per-domain business-logic registry (C4)
// - buffer_protocol:   persistent notification-buffer drain/acknowledge (C5)
// - capture:           change-capture state machine (C6)
// - reindex:           override-driven time-windowed reindex planner (C7)
// - domain, config, cli: mode selection and configuration binding (C8)

mod buffer_protocol;
mod capture;
mod cli;
mod config;
mod domain;
mod gateway;
mod hooks;
mod index;
mod normalize;
mod notify;
mod reindex;

#[cfg(test)]
mod test_support;

use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use gateway::ConnectionParams;
use notify::PgNotificationSource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(level: &str) {
    let default_filter = format!("indexer={level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_tracing(&config.global.logging_level);

    let domain = match Config::resolve_domain(cli.domain.clone()) {
        Ok(domain) => domain,
        Err(e) => {
            tracing::error!(error = %e, "cannot resolve domain");
            std::process::exit(1);
        }
    };

    let domain_config = match config.bind_domain(&domain) {
        Ok(dc) => dc,
        Err(e) => {
            tracing::error!(error = %e, domain = %domain, "missing bound configuration");
            std::process::exit(1);
        }
    };

    if let Some(Commands::Config { show: true }) = cli.command {
        println!("{}", config.describe(&domain_config));
        return Ok(());
    }

    tracing::info!(domain = %domain, "starting indexer");

    let runtime = domain::Runtime::connect(config, &domain).await?;

    if cli.full {
        runtime.run_full().await?;
    }

    if cli.listener {
        let connection_params = ConnectionParams {
            name: runtime.config.global.database_name.clone(),
            user: runtime.config.secrets.database_user.clone(),
            password: runtime.config.secrets.database_password.clone(),
            host: runtime.config.global.database_host.clone(),
            port: runtime.config.global.database_port,
            schema: runtime.config.global.database_schema.clone(),
        };
        runtime
            .run_listener(|| {
                let connection_string = connection_params.connection_string();
                async move { PgNotificationSource::connect(&connection_string).await }
            })
            .await?;
    }

    Ok(())
}
