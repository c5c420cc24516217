use crate::{
    ledger::Commitment,
    program::{
        Address,
        DEFAULT_PROGRAM_ID,
        level_game_account,
    },
    submission::{
        ConfirmationPolicy,
        DEFAULT_CONFIRM_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    },
    sync::{
        DEFAULT_RETRY_BACKOFF,
        RetryPolicy,
    },
};
use clap::{
    ArgGroup,
    Parser,
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use std::{
    fmt,
    path::PathBuf,
    time::Duration,
};
use tracing::debug;

pub const DEFAULT_DEVNET_RPC_URL: &str = "https://api.devnet.solana.com";
pub const DEFAULT_TESTNET_RPC_URL: &str = "https://api.testnet.solana.com";
pub const DEFAULT_LOCAL_RPC_URL: &str = "http://127.0.0.1:8899";

#[derive(Parser, Debug)]
#[command(
    name = "tiny-adventure",
    about = "Walk the Tiny Adventure hero along its on-chain track",
    version,
    group(
        ArgGroup::new("network")
            .args(["devnet", "testnet", "local"])
            .required(true)
    )
)]
pub struct Args {
    /// Connect to Solana devnet
    #[arg(long)]
    pub devnet: bool,

    /// Connect to Solana testnet
    #[arg(long)]
    pub testnet: bool,

    /// Connect to a local validator
    #[arg(long)]
    pub local: bool,

    /// Override RPC URL
    #[arg(long)]
    pub rpc_url: Option<String>,

    /// Override pub/sub URL (derived from the RPC URL by default)
    #[arg(long)]
    pub ws_url: Option<String>,

    #[arg(long, default_value = DEFAULT_PROGRAM_ID)]
    pub program_id: Address,

    /// Game-data account; derived from the program id and level when omitted
    #[arg(long)]
    pub game_account: Option<Address>,

    #[arg(long, default_value_t = 1)]
    pub level: u8,

    /// Wallet bridge base URL; without it actions go through the relay
    #[arg(long)]
    pub wallet_url: Option<String>,

    /// Relay endpoint used when no wallet is connected
    #[arg(long)]
    pub relay_url: Option<String>,

    #[arg(long, value_enum, default_value_t = Commitment::Confirmed)]
    pub commitment: Commitment,

    #[arg(long, default_value_t = DEFAULT_CONFIRM_TIMEOUT.as_secs())]
    pub confirm_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_RETRY_BACKOFF.as_millis() as u64)]
    pub retry_backoff_ms: u64,

    /// Run one action and exit instead of starting the terminal UI
    #[arg(short, long, value_enum, default_value = "play")]
    pub action: Action,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Action {
    Play,
    Status,
    Initialize,
    MoveLeft,
    MoveRight,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkTarget {
    Devnet { url: String },
    Testnet { url: String },
    LocalNode { url: String },
}

impl NetworkTarget {
    pub fn url(&self) -> &str {
        match self {
            NetworkTarget::Devnet { url }
            | NetworkTarget::Testnet { url }
            | NetworkTarget::LocalNode { url } => url,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NetworkTarget::Devnet { .. } => "devnet",
            NetworkTarget::Testnet { .. } => "testnet",
            NetworkTarget::LocalNode { .. } => "local",
        }
    }
}

impl fmt::Display for NetworkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.url())
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub network: NetworkTarget,
    pub ws_url: String,
    pub program_id: Address,
    pub game_account: Address,
    pub level: u8,
    pub wallet_url: Option<String>,
    pub relay_url: Option<String>,
    pub confirmation: ConfirmationPolicy,
    pub retry: RetryPolicy,
    pub action: Action,
}

impl Args {
    fn network(&self) -> Result<NetworkTarget> {
        let network = if self.devnet {
            NetworkTarget::Devnet {
                url: self
                    .rpc_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DEVNET_RPC_URL.to_string()),
            }
        } else if self.testnet {
            NetworkTarget::Testnet {
                url: self
                    .rpc_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TESTNET_RPC_URL.to_string()),
            }
        } else if self.local {
            NetworkTarget::LocalNode {
                url: self
                    .rpc_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOCAL_RPC_URL.to_string()),
            }
        } else {
            return Err(eyre!(
                "Select a network with --devnet, --testnet, or --local"
            ));
        };
        Ok(network)
    }

    /// Resolves flags into the settings the client runs with.
    pub fn resolve(self) -> Result<AppConfig> {
        let network = self.network()?;
        let ws_url = match &self.ws_url {
            Some(url) => url.clone(),
            None => derive_ws_url(network.url())?,
        };

        let game_account = match self.game_account {
            Some(address) => address,
            None => {
                let (address, bump) = level_game_account(&self.program_id, self.level);
                debug!(level = self.level, %address, bump, "derived level game account");
                address
            }
        };

        Ok(AppConfig {
            network,
            ws_url,
            program_id: self.program_id,
            game_account,
            level: self.level,
            wallet_url: self.wallet_url,
            relay_url: self.relay_url,
            confirmation: ConfirmationPolicy {
                commitment: self.commitment,
                poll_interval: DEFAULT_POLL_INTERVAL,
                timeout: Duration::from_secs(self.confirm_timeout_secs),
            },
            retry: RetryPolicy {
                backoff: Duration::from_millis(self.retry_backoff_ms),
                max_attempts: None,
            },
            action: self.action,
        })
    }
}

/// Pub/sub endpoint for an RPC URL: same host, websocket scheme, and the
/// validator's default port shifted by one.
pub fn derive_ws_url(rpc_url: &str) -> Result<String> {
    let (scheme, rest) = rpc_url
        .split_once("://")
        .ok_or_else(|| eyre!("RPC URL {rpc_url} has no scheme"))?;
    let ws_scheme = match scheme {
        "http" => "ws",
        "https" => "wss",
        other => return Err(eyre!("Unsupported RPC URL scheme {other}")),
    };
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, Some(path)),
        None => (rest, None),
    };
    let authority = match authority.rsplit_once(':') {
        Some((host, "8899")) => format!("{host}:8900"),
        _ => authority.to_string(),
    };
    Ok(match path {
        Some(path) => format!("{ws_scheme}://{authority}/{path}"),
        None => format!("{ws_scheme}://{authority}"),
    })
}

pub fn log_dir() -> PathBuf {
    PathBuf::from(shellexpand::tilde("~/.tiny-adventure/logs").into_owned())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::game_account;

    #[test]
    fn derive_ws_url__maps_scheme_and_local_port() {
        assert_eq!(
            derive_ws_url("https://api.devnet.solana.com").unwrap(),
            "wss://api.devnet.solana.com"
        );
        assert_eq!(
            derive_ws_url("http://127.0.0.1:8899").unwrap(),
            "ws://127.0.0.1:8900"
        );
        assert_eq!(
            derive_ws_url("https://rpc.example.com/key/abc").unwrap(),
            "wss://rpc.example.com/key/abc"
        );
        assert!(derive_ws_url("ftp://example.com").is_err());
    }

    #[test]
    fn parse__requires_exactly_one_network() {
        assert!(Args::try_parse_from(["tiny-adventure"]).is_err());
        assert!(
            Args::try_parse_from(["tiny-adventure", "--devnet", "--local"]).is_err()
        );
    }

    #[test]
    fn resolve__explicit_account_overrides_derived_one() {
        // given
        let account = game_account().to_string();
        let args = Args::try_parse_from([
            "tiny-adventure",
            "--local",
            "--game-account",
            &account,
            "--action",
            "move-right",
        ])
        .unwrap();

        // when
        let config = args.resolve().unwrap();

        // then
        assert_eq!(config.game_account, game_account());
        assert_eq!(config.network.url(), DEFAULT_LOCAL_RPC_URL);
        assert_eq!(config.ws_url, "ws://127.0.0.1:8900");
        assert_eq!(config.action, Action::MoveRight);
        assert_eq!(config.confirmation.timeout, DEFAULT_CONFIRM_TIMEOUT);
    }

    #[test]
    fn resolve__derives_level_account_without_any_local_state() {
        // given
        let args = Args::try_parse_from(["tiny-adventure", "--devnet"]).unwrap();

        // when
        let config = args.resolve().unwrap();

        // then
        assert_eq!(
            config.game_account.to_string(),
            "EuZBDNeWsoJb4qhP8Dq757TBrVmrCjP2c55q48L811UF"
        );
        assert_eq!(config.level, 1);
        assert_eq!(config.action, Action::Play);
        assert_eq!(config.network.to_string(), "devnet (https://api.devnet.solana.com)");
    }

    #[test]
    fn resolve__level_selects_its_own_account() {
        // given
        let args =
            Args::try_parse_from(["tiny-adventure", "--testnet", "--level", "2"]).unwrap();

        // when
        let config = args.resolve().unwrap();

        // then
        assert_eq!(
            config.game_account.to_string(),
            "2G5a6nhabKhok1HkkyA6ub8RuWvKUBhySd91Aptpkg4r"
        );
    }
}
