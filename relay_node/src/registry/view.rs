use std::collections::BTreeSet;

use crate::crypto::{Address, Hash};
use crate::error::Result;
use crate::types::{Claim, EvidenceKind, Params, RequestorInfo, ServicerInfo, SessionHeader};

/// Point-in-time reads of on-chain state.
///
/// Every method taking a height reads the snapshot committed at that
/// height; heights above `latest_height` fail with `BlockNotFound`.
pub trait RegistryView: Send + Sync {
    fn latest_height(&self) -> i64;

    fn block_hash(&self, height: i64) -> Result<Hash>;

    fn get_params(&self, height: i64) -> Result<Params>;

    /// Staked, unjailed servicers for `chain` in `geo_zone`.
    fn validators_for(&self, chain: &str, geo_zone: &str, height: i64) -> Result<Vec<ServicerInfo>>;

    fn servicer(&self, address: &Address, height: i64) -> Result<Option<ServicerInfo>>;

    fn requestor(&self, address: &Address, height: i64) -> Result<Option<RequestorInfo>>;

    fn get_claim(
        &self,
        address: &Address,
        header: &SessionHeader,
        kind: EvidenceKind,
        height: i64,
    ) -> Result<Option<Claim>>;

    fn get_all_claims(&self, address: &Address, height: i64) -> Result<Vec<Claim>>;

    fn supported_chains(&self, height: i64) -> Result<BTreeSet<String>> {
        Ok(self.get_params(height)?.supported_blockchains.into_iter().collect())
    }

    fn supported_geo_zones(&self, height: i64) -> Result<BTreeSet<String>> {
        Ok(self.get_params(height)?.supported_geo_zones.into_iter().collect())
    }
}
