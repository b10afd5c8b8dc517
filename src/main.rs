use anyhow::{Context, Result};
use ethers::types::Address;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use xburn_sync::addresses::{AddressBook, ContractName};
use xburn_sync::config::{Config, NETWORKS};
use xburn_sync::context::ChainContext;
use xburn_sync::node::{ChainRouter, EthersNode};
use xburn_sync::price::DexScreenerSource;
use xburn_sync::stats::StatField;
use xburn_sync::user_settings::UserSettings;
use xburn_sync::utils::{format_token, format_usd};
use xburn_sync::SyncEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let mut settings = UserSettings::load();
    let config = Config::from_settings(&settings);
    let address_book = load_address_book(&settings)?;
    let router = build_router(&settings).await?;

    let account = match env::var("XBURN_ACCOUNT") {
        Ok(value) => Some(
            value
                .trim()
                .parse::<Address>()
                .with_context(|| format!("XBURN_ACCOUNT is not an address: {}", value))?,
        ),
        Err(_) => settings.reconnect_account(),
    };

    info!("Syncing {} (chain {}) via {}", config.network_label(), config.chain_id, config.rpc_url);
    if !address_book.is_fully_deployed(config.chain_id) {
        warn!("Address book is incomplete for chain {}, some values will be missing", config.chain_id);
    }

    let context = Arc::new(ChainContext::new(config.chain_id, account, Arc::new(address_book)));
    let engine = SyncEngine::new(context, Arc::new(router), &config.sync)
        .with_price_source(Arc::new(DexScreenerSource::new(config.price_api.clone())?));

    report(&engine).await;

    if let Some(account) = account {
        settings.mark_connected(account);
        settings.save()?;
    }
    Ok(())
}

fn load_address_book(settings: &UserSettings) -> Result<AddressBook> {
    let path = env::var("XBURN_ADDRESS_BOOK")
        .ok()
        .map(PathBuf::from)
        .or_else(|| settings.address_book_path.clone());

    match path {
        Some(path) => AddressBook::load_file(&path)
            .with_context(|| format!("Failed to load address book {}", path.display())),
        None => Ok(AddressBook::builtin().clone()),
    }
}

/// One node per known network, honouring custom RPC overrides.
async fn build_router(settings: &UserSettings) -> Result<ChainRouter> {
    let mut router = ChainRouter::new();
    for network in NETWORKS {
        let rpc_url = settings
            .get_custom_rpc(network.chain_id)
            .cloned()
            .unwrap_or_else(|| network.default_rpc.to_string());
        let provider = Config::new(rpc_url, network.chain_id).get_provider().await?;
        router.insert(network.chain_id, Arc::new(EthersNode::new(provider)));
    }
    Ok(router)
}

async fn report(engine: &SyncEngine) {
    match engine.stats().await {
        Ok(Some(stats)) => {
            for (field, value) in &stats.values {
                match field {
                    StatField::UserRank
                    | StatField::UserLockCount
                    | StatField::DaysSinceLaunch
                    | StatField::TotalLocks
                    | StatField::CurrentAmp => println!("{:<18} {}", field, value),
                    _ => println!("{:<18} {}", field, format_token(*value)),
                }
            }
            if let Some(ratio) = stats.xburn_price_in_xen() {
                println!("{:<18} {:.2} XEN", "XBURN price", ratio);
            }
            if let Some(error) = stats.error {
                warn!("{}", error);
            }
        }
        Ok(None) => info!("Stats refresh superseded by a context change"),
        Err(e) => warn!("Stats unavailable: {}", e),
    }

    match engine.price().await {
        Ok(Some(quote)) => {
            if let Some(price) = quote.price_usd {
                println!("{:<18} {}", "XBURN (USD)", format_usd(price));
            }
            if let Some(liquidity) = quote.liquidity_usd {
                println!("{:<18} {}", "Liquidity (USD)", format_usd(liquidity));
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Price unavailable: {}", e),
    }

    if engine.context().account().is_none() {
        info!("No account connected, skipping balances and positions");
        return;
    }

    for token in [ContractName::Xen, ContractName::XburnToken] {
        match engine.token_balance(token).await {
            Ok(Some(balance)) => println!("{:<18} {}", format!("{} balance", token), format_token(balance)),
            Ok(None) => {}
            Err(e) => warn!("{} balance unavailable: {}", token, e),
        }
    }
    match engine.allowance(ContractName::Xen, ContractName::XburnMinter).await {
        Ok(Some(allowance)) => println!("{:<18} {}", "XEN allowance", format_token(allowance)),
        Ok(None) => {}
        Err(e) => warn!("Allowance unavailable: {}", e),
    }

    let ledger = engine.ledger();
    match ledger.list(0).await {
        Ok(Some(positions)) => {
            println!("{} position(s) on the first page", positions.len());
            for position in positions {
                match ledger.load_details(position.id).await {
                    Ok(Some(loaded)) => match loaded.details {
                        Some(details) => println!(
                            "  #{:<6} {:>14} XBURN  {} days  matures {}{}",
                            loaded.id,
                            format_token(details.amount),
                            details.term_days,
                            details
                                .maturity_time()
                                .map(|t| t.format("%Y-%m-%d").to_string())
                                .unwrap_or_else(|| "?".to_string()),
                            if details.claimed {
                                "  (claimed)"
                            } else if details.is_claimable() {
                                "  (claimable)"
                            } else {
                                ""
                            }
                        ),
                        None => println!("  #{:<6} gone", loaded.id),
                    },
                    Ok(None) => break,
                    Err(e) => warn!("Position #{} details unavailable: {}", position.id, e),
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Positions unavailable: {}", e),
    }
}
