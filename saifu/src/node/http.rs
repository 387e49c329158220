//! HTTP node client for a wallet-indexer endpoint.
//!
//! Speaks a small JSON REST surface: script UTXO listing, outpoint
//! validation, transaction lookup and broadcast, plus a long-poll `/events`
//! endpoint that feeds [`FeedEvent`]s into the engine's feed channel. The
//! watched-script set is kept client side and sent with every poll.
//!
//! Reads go through [`with_read_retry`]; broadcast is submitted exactly once.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{NodeError, NodeResult};
use crate::node::{FeedEvent, NodeClient, RetryPolicy, UtxoState, UtxoStatus, with_read_retry};

/// Pause after a failed or malformed event poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Node client backed by an HTTP wallet indexer.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    events_tx: mpsc::Sender<FeedEvent>,
    watched: Arc<RwLock<BTreeSet<String>>>,
}

impl HttpNodeClient {
    /// Create a client for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Unavailable`] when the HTTP client cannot be
    /// constructed.
    pub fn new(
        base_url: impl Into<String>,
        retry: RetryPolicy,
        events_tx: mpsc::Sender<FeedEvent>,
    ) -> NodeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(retry.timeout)
            .build()
            .map_err(|err| NodeError::unavailable(format!("http client: {err}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            retry,
            events_tx,
            watched: Arc::new(RwLock::new(BTreeSet::new())),
        })
    }

    /// Prove the endpoint is reachable.
    ///
    /// # Errors
    ///
    /// Returns the transport or rejection error after retries are exhausted.
    pub async fn check_connectivity(&self) -> NodeResult<()> {
        let url = format!("{}/health", self.base_url);
        with_read_retry(self.retry, || async {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|err| self.transport_error(err))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(NodeError::rejected(format!(
                    "health check returned {}",
                    response.status()
                )))
            }
        })
        .await
    }

    /// Start the long-poll task pushing chain events into the feed channel.
    ///
    /// The task ends when the feed receiver is dropped.
    #[must_use]
    pub fn spawn_feed(&self) -> JoinHandle<()> {
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let events_tx = self.events_tx.clone();
        let watched = Arc::clone(&self.watched);
        tokio::spawn(async move {
            let mut cursor = 0u64;
            loop {
                if events_tx.is_closed() {
                    debug!("feed receiver dropped, poll loop ending");
                    break;
                }
                let scripts = {
                    let watched = watched.read().await;
                    watched.iter().cloned().collect::<Vec<_>>().join(",")
                };
                let cursor_param = cursor.to_string();
                let request = http.get(format!("{base_url}/events")).query(&[
                    ("scripts", scripts.as_str()),
                    ("cursor", cursor_param.as_str()),
                ]);
                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        match response.json::<EventsResponse>().await {
                            Ok(batch) => {
                                cursor = batch.cursor;
                                for dto in batch.events {
                                    let Some(event) = parse_feed_event(&dto) else {
                                        continue;
                                    };
                                    if events_tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "event batch decode failed");
                                tokio::time::sleep(POLL_RETRY_DELAY).await;
                            }
                        }
                    }
                    Ok(response) => {
                        warn!(status = %response.status(), "event poll rejected");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "event poll failed");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                    }
                }
            }
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> NodeResult<T> {
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        Self::decode(&url, response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        url: String,
        body: &B,
    ) -> NodeResult<T> {
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        Self::decode(&url, response).await
    }

    async fn decode<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> NodeResult<T> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(NodeError::rejected(format!(
                "{url} returned {status}: {detail}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| NodeError::rejected(format!("decode {url}: {err}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> NodeError {
        if err.is_timeout() {
            NodeError::Timeout(self.retry.timeout)
        } else {
            NodeError::unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn subscribe_script(&self, script: &ScriptBuf) -> NodeResult<()> {
        self.watched.write().await.insert(script.to_hex_string());
        Ok(())
    }

    async fn unsubscribe_script(&self, script: &ScriptBuf) -> NodeResult<()> {
        self.watched.write().await.remove(&script.to_hex_string());
        Ok(())
    }

    async fn fetch_utxos(&self, script: &ScriptBuf) -> NodeResult<Vec<(OutPoint, u64)>> {
        let url = format!("{}/script/{}/utxos", self.base_url, script.to_hex_string());
        let dtos: Vec<UtxoDto> = with_read_retry(self.retry, || self.get_json(url.clone())).await?;
        dtos.iter()
            .map(|dto| Ok((parse_outpoint(&dto.txid, dto.vout)?, dto.value)))
            .collect()
    }

    async fn validate_utxos(&self, outpoints: &[OutPoint]) -> NodeResult<Vec<UtxoStatus>> {
        let url = format!("{}/validate", self.base_url);
        let body = ValidateRequest {
            outpoints: outpoints
                .iter()
                .map(|outpoint| OutPointDto {
                    txid: outpoint.txid.to_string(),
                    vout: outpoint.vout,
                })
                .collect(),
        };
        let dtos: Vec<StatusDto> =
            with_read_retry(self.retry, || self.post_json(url.clone(), &body)).await?;
        if dtos.len() != outpoints.len() {
            return Err(NodeError::rejected(format!(
                "validate returned {} statuses for {} outpoints",
                dtos.len(),
                outpoints.len()
            )));
        }
        dtos.iter().map(parse_status).collect()
    }

    async fn fetch_transaction(&self, txid: Txid) -> NodeResult<Vec<TxOut>> {
        let url = format!("{}/tx/{txid}", self.base_url);
        let dto: TxDto = with_read_retry(self.retry, || self.get_json(url.clone())).await?;
        dto.outputs
            .into_iter()
            .map(|output| {
                Ok(TxOut {
                    value: Amount::from_sat(output.value),
                    script_pubkey: ScriptBuf::from_hex(&output.script_hex).map_err(|err| {
                        NodeError::rejected(format!("bad script hex in {txid}: {err}"))
                    })?,
                })
            })
            .collect()
    }

    async fn broadcast(&self, tx: &Transaction) -> NodeResult<Txid> {
        // submitted once: a timed-out broadcast has an unknown outcome
        let url = format!("{}/broadcast", self.base_url);
        let body = BroadcastRequest {
            hex: serialize_hex(tx),
        };
        let response: BroadcastResponse = self.post_json(url, &body).await?;
        response
            .txid
            .parse()
            .map_err(|err| NodeError::rejected(format!("bad txid in broadcast response: {err}")))
    }
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    events: Vec<EventDto>,
    cursor: u64,
}

#[derive(Debug, Deserialize)]
struct EventDto {
    #[serde(rename = "type")]
    kind: String,
    txid: String,
}

#[derive(Debug, Deserialize)]
struct UtxoDto {
    txid: String,
    vout: u32,
    value: u64,
}

#[derive(Debug, Serialize)]
struct ValidateRequest {
    outpoints: Vec<OutPointDto>,
}

#[derive(Debug, Serialize)]
struct OutPointDto {
    txid: String,
    vout: u32,
}

#[derive(Debug, Deserialize)]
struct StatusDto {
    state: String,
    #[serde(default)]
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct TxDto {
    outputs: Vec<TxOutDto>,
}

#[derive(Debug, Deserialize)]
struct TxOutDto {
    script_hex: String,
    value: u64,
}

#[derive(Debug, Serialize)]
struct BroadcastRequest {
    hex: String,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    txid: String,
}

fn parse_outpoint(txid: &str, vout: u32) -> NodeResult<OutPoint> {
    let txid = Txid::from_str(txid)
        .map_err(|err| NodeError::rejected(format!("bad txid {txid}: {err}")))?;
    Ok(OutPoint::new(txid, vout))
}

fn parse_status(dto: &StatusDto) -> NodeResult<UtxoStatus> {
    let state = match dto.state.as_str() {
        "no_such_tx" => UtxoState::NoSuchTx,
        "no_such_output" => UtxoState::NoSuchOutput,
        "spent" => UtxoState::Spent,
        "unspent" => UtxoState::Unspent,
        other => {
            return Err(NodeError::rejected(format!("unknown utxo state {other}")));
        }
    };
    Ok(UtxoStatus {
        state,
        confirmed: dto.confirmed,
    })
}

fn parse_feed_event(dto: &EventDto) -> Option<FeedEvent> {
    let txid = match Txid::from_str(&dto.txid) {
        Ok(txid) => txid,
        Err(err) => {
            warn!(txid = %dto.txid, error = %err, "bad txid in feed event, skipped");
            return None;
        }
    };
    match dto.kind.as_str() {
        "mempool" => Some(FeedEvent::AddedToMempool(txid)),
        "confirmed" => Some(FeedEvent::Confirmed(txid)),
        other => {
            warn!(kind = %other, "unknown feed event kind, skipped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_map_to_states() {
        let status = parse_status(&StatusDto {
            state: "spent".to_string(),
            confirmed: true,
        })
        .unwrap();
        assert_eq!(status.state, UtxoState::Spent);
        assert!(status.confirmed);

        let err = parse_status(&StatusDto {
            state: "pending".to_string(),
            confirmed: false,
        })
        .unwrap_err();
        assert!(matches!(err, NodeError::Rejected(_)));
    }

    #[test]
    fn feed_events_parse_and_skip() {
        let txid = "0000000000000000000000000000000000000000000000000000000000000001";
        let event = parse_feed_event(&EventDto {
            kind: "mempool".to_string(),
            txid: txid.to_string(),
        })
        .unwrap();
        assert!(matches!(event, FeedEvent::AddedToMempool(_)));

        assert!(
            parse_feed_event(&EventDto {
                kind: "reorg".to_string(),
                txid: txid.to_string(),
            })
            .is_none()
        );
        assert!(
            parse_feed_event(&EventDto {
                kind: "mempool".to_string(),
                txid: "zz".to_string(),
            })
            .is_none()
        );
    }

    #[test]
    fn outpoints_parse_from_wire() {
        let txid = "0000000000000000000000000000000000000000000000000000000000000002";
        let outpoint = parse_outpoint(txid, 3).unwrap();
        assert_eq!(outpoint.vout, 3);
        assert!(parse_outpoint("nope", 0).is_err());
    }
}
