use anyhow::{anyhow, Result};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::invoice::Invoice;
use crate::listener::RequestRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// The router handed out a request id this store has already recorded
    RequestSeen,
    /// The invoice changed since it was read
    InvoiceChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled,
    /// Another writer already moved the request record on
    RecordChanged,
    InvoiceChanged,
}

/// Occupancy of an invoice's single request slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Claimed by a dispatcher that has not yet learned the request id
    Reserved { since: u64 },
    Bound { request_id: H256 },
}

/// Persistent protocol state using sled
#[derive(Clone)]
pub struct OracleStore {
    db: sled::Db,
}

impl OracleStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self { db: sled::open(path)? })
    }

    /// Throwaway store, removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn get_invoice(&self, token_id: U256) -> Result<Option<Invoice>> {
        self.get_json(&invoice_key(token_id))
    }

    /// Insert a new invoice; false if the token id is taken
    pub fn insert_invoice(&self, invoice: &Invoice) -> Result<bool> {
        let value = serde_json::to_vec(invoice)?;
        let swapped = self.db.compare_and_swap(
            invoice_key(invoice.token_id).as_bytes(),
            None as Option<&[u8]>,
            Some(value),
        )?;
        self.db.flush()?;
        Ok(swapped.is_ok())
    }

    pub fn invoices(&self) -> Result<Vec<Invoice>> {
        self.scan_json(b"invoice:")
    }

    pub fn link(&self, token_id: U256) -> Result<Option<LinkState>> {
        self.get_json(&link_key(token_id))
    }

    /// Claim the invoice's request slot.
    ///
    /// Returns `None` when claimed, or the current occupant.
    pub fn reserve(&self, token_id: U256, now: u64) -> Result<Option<LinkState>> {
        let value = serde_json::to_vec(&LinkState::Reserved { since: now })?;
        match self.db.compare_and_swap(
            link_key(token_id).as_bytes(),
            None as Option<&[u8]>,
            Some(value),
        )? {
            Ok(()) => {
                self.db.flush()?;
                Ok(None)
            }
            Err(cas) => {
                let current = cas
                    .current
                    .map(|raw| serde_json::from_slice(&raw))
                    .transpose()?;
                Ok(current)
            }
        }
    }

    /// Drop a reservation that never got bound to a request id
    pub fn release_reservation(&self, token_id: U256, since: u64) -> Result<bool> {
        let expected = serde_json::to_vec(&LinkState::Reserved { since })?;
        let swapped = self.db.compare_and_swap(
            link_key(token_id).as_bytes(),
            Some(expected),
            None as Option<&[u8]>,
        )?;
        self.db.flush()?;
        Ok(swapped.is_ok())
    }

    pub fn reservations(&self) -> Result<Vec<(U256, LinkState)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(b"link:") {
            let (key, value) = item?;
            let token = std::str::from_utf8(&key[b"link:".len()..])?;
            let token_id = U256::from_dec_str(token).map_err(|e| anyhow!("bad link key {}: {:?}", token, e))?;
            out.push((token_id, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    pub fn request(&self, request_id: H256) -> Result<Option<RequestRecord>> {
        self.get_json(&request_key(request_id))
    }

    pub fn requests(&self) -> Result<Vec<RequestRecord>> {
        self.scan_json(b"request:")
    }

    /// Record a freshly submitted request: listener record, slot binding and
    /// invoice link in one transaction. `prev` must still be the stored invoice.
    pub fn bind(&self, record: &RequestRecord, prev: &Invoice, next: &Invoice) -> Result<BindOutcome> {
        let request_key = request_key(record.request_id);
        let link_key = link_key(record.token_id);
        let invoice_key = invoice_key(next.token_id);
        let record_bytes = serde_json::to_vec(record)?;
        let link_bytes = serde_json::to_vec(&LinkState::Bound { request_id: record.request_id })?;
        let prev_bytes = serde_json::to_vec(prev)?;
        let next_bytes = serde_json::to_vec(next)?;

        let outcome = self.db.transaction(|tx| {
            if tx.get(request_key.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(BindOutcome::RequestSeen));
            }
            if tx.get(invoice_key.as_bytes())?.as_deref() != Some(prev_bytes.as_slice()) {
                return Err(ConflictableTransactionError::Abort(BindOutcome::InvoiceChanged));
            }
            tx.insert(request_key.as_bytes(), record_bytes.as_slice())?;
            tx.insert(link_key.as_bytes(), link_bytes.as_slice())?;
            tx.insert(invoice_key.as_bytes(), next_bytes.as_slice())?;
            Ok(BindOutcome::Bound)
        });

        match outcome {
            Ok(bound) => {
                self.db.flush()?;
                Ok(bound)
            }
            Err(TransactionError::Abort(conflict)) => Ok(conflict),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Persist a listener transition together with its invoice update.
    ///
    /// `prev` must still be the stored record and `invoice`, when given as
    /// `(prev, next)`, the stored invoice. The invoice's slot is freed only if
    /// still bound to this request.
    pub fn settle(
        &self,
        prev: &RequestRecord,
        next: &RequestRecord,
        invoice: Option<(&Invoice, &Invoice)>,
    ) -> Result<SettleOutcome> {
        let request_key = request_key(next.request_id);
        let link_key = link_key(next.token_id);
        let prev_record = serde_json::to_vec(prev)?;
        let next_record = serde_json::to_vec(next)?;
        let bound = serde_json::to_vec(&LinkState::Bound { request_id: next.request_id })?;
        let invoice_entry = match invoice {
            Some((prev, next)) => Some((
                invoice_key(next.token_id),
                serde_json::to_vec(prev)?,
                serde_json::to_vec(next)?,
            )),
            None => None,
        };

        let outcome = self.db.transaction(|tx| {
            if tx.get(request_key.as_bytes())?.as_deref() != Some(prev_record.as_slice()) {
                return Err(ConflictableTransactionError::Abort(SettleOutcome::RecordChanged));
            }
            if let Some((key, prev_bytes, next_bytes)) = &invoice_entry {
                if tx.get(key.as_bytes())?.as_deref() != Some(prev_bytes.as_slice()) {
                    return Err(ConflictableTransactionError::Abort(SettleOutcome::InvoiceChanged));
                }
                tx.insert(key.as_bytes(), next_bytes.as_slice())?;
            }
            tx.insert(request_key.as_bytes(), next_record.as_slice())?;
            if tx.get(link_key.as_bytes())?.as_deref() == Some(bound.as_slice()) {
                tx.remove(link_key.as_bytes())?;
            }
            Ok(SettleOutcome::Settled)
        });

        match outcome {
            Ok(settled) => {
                self.db.flush()?;
                Ok(settled)
            }
            Err(TransactionError::Abort(conflict)) => Ok(conflict),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Replace `prev` with `next`; false if someone else updated it first
    pub fn swap_invoice(&self, prev: &Invoice, next: &Invoice) -> Result<bool> {
        let swapped = self.db.compare_and_swap(
            invoice_key(next.token_id).as_bytes(),
            Some(serde_json::to_vec(prev)?),
            Some(serde_json::to_vec(next)?),
        )?;
        self.db.flush()?;
        Ok(swapped.is_ok())
    }

    /// Next block to read fulfillment events from
    pub fn cursor(&self) -> Result<Option<u64>> {
        self.get_json("cursor")
    }

    pub fn set_cursor(&self, block: u64) -> Result<()> {
        self.db.insert(b"cursor", serde_json::to_vec(&block)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: for<'de> Deserialize<'de>>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (_key, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

fn invoice_key(token_id: U256) -> String {
    format!("invoice:{}", token_id)
}

fn link_key(token_id: U256) -> String {
    format!("link:{}", token_id)
}

fn request_key(request_id: H256) -> String {
    format!("request:{}", hex::encode(request_id.as_bytes()))
}
