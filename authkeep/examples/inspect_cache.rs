use std::{path::PathBuf, sync::Arc};

use authkeep::{Authority, ReqwestNetworkClient, SilentClient, SilentConfig, SilentRequest};
use authkeep_cache::{
    format::PersistedFormat, storage::PlaintextFileStorage, ClientId, PersistentCacheAccessor,
    ScopeSet, TokenCache,
};
use clap::Parser;
use color_eyre::eyre::eyre;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
struct Opts {
    /// The persisted token cache
    #[clap(short = 'f', long, env, default_value = ".tokens.json")]
    cache_file: PathBuf,

    /// The client ID of the application
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The authority, e.g. `https://login.example.com/common`
    #[clap(short, long, env)]
    authority: url::Url,

    /// Scopes to acquire a token for; only lists accounts when omitted
    #[clap(short, long, env)]
    scopes: Option<String>,

    /// The username of the account to acquire a token for
    #[clap(short, long, env)]
    login_hint: Option<String>,

    /// Skip cached access tokens
    #[clap(long)]
    force_refresh: bool,

    /// Rewrite the cache in the single-entry format older releases read
    #[clap(long)]
    legacy_format: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let mut accessor =
        PersistentCacheAccessor::open(PlaintextFileStorage::new(&opts.cache_file)).await?;
    if opts.legacy_format {
        accessor = accessor.with_format(PersistedFormat::SingleEntry);
    }
    let cache = Arc::new(TokenCache::new(Arc::new(accessor)));

    let authority =
        Authority::from_url(&opts.authority).ok_or_else(|| eyre!("authority has no tenant"))?;
    let client = SilentClient::from_network(
        SilentConfig::new(opts.client_id, authority),
        cache,
        Arc::new(ReqwestNetworkClient::default()),
    );

    for account in client.accounts().await? {
        println!(
            "{} {} ({})",
            account.home_account_id,
            account.username.as_ref().map_or("-", |u| u.as_str()),
            account.tenant_id,
        );
    }

    let scopes = match opts.scopes {
        Some(scopes) => ScopeSet::parse(&scopes),
        None => return Ok(()),
    };

    let mut request = SilentRequest::new(scopes).with_force_refresh(opts.force_refresh);
    if let Some(login_hint) = opts.login_hint {
        request = request.with_login_hint(login_hint);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = client.acquire_token_silent(request, &cancel).await?;
    println!(
        "{:?} token for [{}] expires at {}{}",
        result.source,
        result.scopes,
        result.expires_at,
        if result.is_extended_lifetime_token {
            " (extended lifetime)"
        } else {
            ""
        },
    );
    println!("{:#?}", result.access_token);

    client.shutdown();
    Ok(())
}
