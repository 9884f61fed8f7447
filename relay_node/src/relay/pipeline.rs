use log::debug;

use crate::chains::HostedBlockchain;
use crate::engine::{Engine, Identity};
use crate::error::{Error, Result};
use crate::evidence::evidence_key;
use crate::merkle::MAX_LEAF_BIN;
use crate::protocol::HandlerMsg;
use crate::session;
use crate::storage::StorageError;
use crate::types::{DispatchResponse, EvidenceKind, EvidenceLeaf, Params, Relay, RelayResponse, SessionHeader};

use super::budget::servicer_limit;

/// Services one relay end to end.
///
/// Every check before the upstream call is synchronous and short-circuits;
/// the only suspension point is the forward. The budget slot is reserved
/// after admission, so a relay rejected as a replay or for its session
/// never holds one. Evidence is durable before the signed response is
/// returned. A dispatch for the current session is attached when the relay
/// targeted an earlier one.
pub async fn handle_relay(engine: &Engine, relay: Relay) -> Result<(RelayResponse, Option<DispatchResponse>)> {
    let admitted = match admit(engine, &relay) {
        Ok(admitted) => admitted,
        Err(e) => {
            debug!("relay rejected: {}", e);
            return Err(e);
        }
    };
    let Admitted {
        identity,
        chain,
        current_height,
        limit,
        stale_session,
    } = admitted;

    let header = relay.proof.session_header();
    let reservation = identity.budget.reserve(
        header.requestor_pub_key.address(),
        &header.chain,
        header.session_block_height,
        limit,
        || {
            identity
                .evidence
                .get_by_header(&header, EvidenceKind::Relay)
                .ok()
                .flatten()
                .map(|m| m.total_payable_relays)
                .unwrap_or(0)
        },
    )?;

    let body = engine.forwarder().forward(&chain, &relay.payload).await?;

    let response = RelayResponse::sign(identity.key(), body, relay.proof.clone())?;
    // the claim handler may have sealed an ended session during the forward
    let (key, meta) = match identity.evidence.add_proof(EvidenceLeaf::Relay(relay.proof)) {
        Ok(added) => added,
        Err(Error::Storage(StorageError::Sealed(_))) => {
            return Err(session_closed(engine, &header, current_height));
        }
        Err(e) => return Err(e),
    };
    reservation.commit();
    engine.notify(HandlerMsg::RelayAccepted {
        servicer: *identity.public_key(),
        key,
    });
    debug!(
        "relay served for chain {} session {} ({} leaves)",
        header.chain, header.session_block_height, meta.leaf_count
    );

    let dispatch = if stale_session {
        session::dispatch(engine.registry(), &header, current_height).ok()
    } else {
        None
    };
    Ok((response, dispatch))
}

struct Admitted<'a> {
    identity: &'a Identity,
    chain: HostedBlockchain,
    current_height: i64,
    limit: u64,
    stale_session: bool,
}

/// Steps before the upstream call.
fn admit<'a>(engine: &'a Engine, relay: &Relay) -> Result<Admitted<'a>> {
    relay.validate_basic()?;
    let proof = &relay.proof;
    if proof.bin() > MAX_LEAF_BIN {
        return Err(Error::MalformedRelay(format!("entropy {} out of range", proof.entropy)));
    }

    let registry = engine.registry();
    let current_height = registry.latest_height();
    let params = registry.get_params(current_height)?;
    if !params.supports_chain(&proof.blockchain) {
        return Err(Error::UnsupportedChain(proof.blockchain.clone()));
    }
    let chain = engine
        .chains()
        .get(&proof.blockchain)
        .ok_or_else(|| Error::UnsupportedChain(proof.blockchain.clone()))?;
    if !params.supports_geo_zone(&proof.geo_zone) {
        return Err(Error::UnsupportedGeoZone(proof.geo_zone.clone()));
    }
    if let Some(zone) = engine.geo_zone() {
        if zone.id != proof.geo_zone {
            return Err(Error::UnsupportedGeoZone(proof.geo_zone.clone()));
        }
    }
    let identity = engine
        .identity(&proof.servicer_pub_key)
        .ok_or_else(|| Error::UnknownServicer(proof.servicer_pub_key.to_hex()))?;

    proof.aat.validate()?;
    proof.verify_client_signature()?;

    let requestor_address = proof.aat.requestor_pub_key.address();
    let requestor = registry
        .requestor(&requestor_address, current_height)?
        .ok_or_else(|| Error::NotStakedRequestor(requestor_address.to_hex()))?;
    if !requestor.chains.iter().any(|c| c == &proof.blockchain) {
        return Err(Error::NotStakedRequestor(format!(
            "{} for chain {}",
            requestor_address, proof.blockchain
        )));
    }

    let header = proof.session_header();
    if proof.num_servicers != params.servicers_per_session {
        return Err(Error::InvalidSession {
            reason: format!(
                "sessions hold {} servicers, relay asked for {}",
                params.servicers_per_session, proof.num_servicers
            ),
            dispatch: current_dispatch(engine, &params, &header, current_height).map(Box::new),
        });
    }
    let stale_session = check_sync_window(engine, &params, &header, current_height)?;

    let session = identity.sessions.get_or_derive(registry, &header)?;
    if !session.contains(identity.public_key()) {
        let dispatch = session::dispatch(registry, &header, current_height).ok();
        return Err(Error::InvalidSession {
            reason: format!("servicer {} is not in the session", identity.address()),
            dispatch: dispatch.map(Box::new),
        });
    }

    if stale_session {
        check_open_evidence(engine, identity, &header, current_height)?;
    }
    identity
        .evidence
        .precheck(&header, EvidenceKind::Relay, proof.entropy)?;

    Ok(Admitted {
        identity,
        chain,
        current_height,
        limit: servicer_limit(requestor.max_relays, proof.num_servicers),
        stale_session,
    })
}

/// The relay must target the current session or one within the sync
/// allowance before it. Returns whether the target is an earlier session.
fn check_sync_window(engine: &Engine, params: &Params, header: &SessionHeader, current_height: i64) -> Result<bool> {
    let height = header.session_block_height;
    let current_session = params.session_start(current_height);
    let oldest = current_session - params.client_session_sync_allowance * params.session_block_frequency;
    if params.is_session_aligned(height) && height >= oldest && height <= current_session {
        return Ok(height < current_session);
    }
    Err(Error::InvalidSession {
        reason: format!(
            "session height {} outside [{}, {}] at height {}",
            height, oldest, current_session, current_height
        ),
        dispatch: current_dispatch(engine, params, header, current_height).map(Box::new),
    })
}

/// A relay for an ended session may only join evidence the claim handler
/// has not sealed yet. The handler acts at the session end, so without
/// open evidence there is no claim left to carry the relay.
fn check_open_evidence(engine: &Engine, identity: &Identity, header: &SessionHeader, current_height: i64) -> Result<()> {
    let open = match identity.evidence.get_by_header(header, EvidenceKind::Relay)? {
        Some(meta) => !meta.sealed && !identity.evidence.is_sealed(&evidence_key(header, EvidenceKind::Relay)?),
        None => false,
    };
    if open {
        Ok(())
    } else {
        Err(session_closed(engine, header, current_height))
    }
}

fn session_closed(engine: &Engine, header: &SessionHeader, current_height: i64) -> Error {
    let dispatch = engine
        .registry()
        .get_params(current_height)
        .ok()
        .and_then(|params| current_dispatch(engine, &params, header, current_height));
    Error::InvalidSession {
        reason: format!(
            "session {} has ended and its evidence is closed",
            header.session_block_height
        ),
        dispatch: dispatch.map(Box::new),
    }
}

/// Dispatch for the session the client should be talking to now.
fn current_dispatch(
    engine: &Engine,
    params: &Params,
    header: &SessionHeader,
    current_height: i64,
) -> Option<DispatchResponse> {
    let mut fresh = header.clone();
    fresh.session_block_height = params.session_start(current_height);
    fresh.num_servicers = params.servicers_per_session;
    session::dispatch(engine.registry(), &fresh, current_height).ok()
}
