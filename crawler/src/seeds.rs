//! DNS seeds used to bootstrap a crawl.

use bitcoin::Network;
use log::{debug, warn};
use nodescan_connection::Endpoint;
use std::collections::BTreeSet;
use tokio::task::JoinSet;

/// Well-known DNS seeds for `network`. Empty for regtest.
pub fn dns_seeds(network: Network) -> &'static [&'static str] {
    match network {
        Network::Bitcoin => &[
            "seed.bitcoin.sipa.be",
            "dnsseed.bluematt.me",
            "seed.bitcoinstats.com",
            "seed.bitcoin.jonasschnelli.ch",
            "seed.btc.petertodd.net",
            "seed.bitcoin.sprovoost.nl",
            "dnsseed.emzy.de",
            "seed.bitcoin.wiz.biz",
            "seed.mainnet.achownodes.xyz",
        ],
        Network::Testnet => &[
            "testnet-seed.bitcoin.jonasschnelli.ch",
            "seed.tbtc.petertodd.net",
            "seed.testnet.bitcoin.sprovoost.nl",
            "testnet-seed.bluematt.me",
        ],
        Network::Signet => &[
            "seed.signet.bitcoin.sprovoost.nl",
            "seed.signet.achownodes.xyz",
        ],
        _ => &[],
    }
}

/// Default p2p port for `network`.
pub fn default_port(network: Network) -> u16 {
    match network {
        Network::Bitcoin => 8333,
        Network::Testnet => 18333,
        Network::Signet => 38333,
        Network::Regtest => 18444,
        _ => 8333,
    }
}

/// Resolve every DNS seed for `network` concurrently.
///
/// Seeds that fail to resolve are logged and skipped. The result is
/// deduplicated and sorted.
pub async fn resolve(network: Network) -> Vec<Endpoint> {
    let port = default_port(network);
    let mut lookups = JoinSet::new();
    for seed in dns_seeds(network) {
        lookups.spawn(async move {
            let result = tokio::net::lookup_host((*seed, port)).await;
            (*seed, result)
        });
    }

    let mut endpoints = BTreeSet::new();
    while let Some(joined) = lookups.join_next().await {
        match joined {
            Ok((seed, Ok(addrs))) => {
                let before = endpoints.len();
                endpoints.extend(addrs.map(Endpoint::from));
                debug!(
                    "Seed {seed} resolved to {} new endpoints",
                    endpoints.len() - before
                );
            }
            Ok((seed, Err(e))) => warn!("DNS lookup failed for {seed}: {e}"),
            Err(e) => warn!("DNS lookup task failed: {e}"),
        }
    }

    endpoints.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports() {
        assert_eq!(default_port(Network::Bitcoin), 8333);
        assert_eq!(default_port(Network::Testnet), 18333);
        assert_eq!(default_port(Network::Signet), 38333);
        assert_eq!(default_port(Network::Regtest), 18444);
    }

    #[test]
    fn test_seed_lists() {
        let mainnet = dns_seeds(Network::Bitcoin);
        assert!(mainnet.contains(&"seed.bitcoin.sipa.be"));
        assert!(!dns_seeds(Network::Signet).is_empty());
        assert!(dns_seeds(Network::Regtest).is_empty());
    }

    #[tokio::test]
    async fn test_resolve_regtest_is_empty() {
        assert!(resolve(Network::Regtest).await.is_empty());
    }
}
