// ===============================
// src/store.rs (durable trade storage)
// ===============================
//
// Dua implementasi TradeStore:
// - MemoryTradeStore : tabel in-memory (tests / mode tanpa file).
// - JsonlTradeStore  : journal JSONL append-only, di-replay saat open.
//   Setiap baris adalah satu operasi (insert / mark / pnl); flush per operasi
//   agar trade yang sudah "persisted" benar-benar ada di disk.
//
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
};
use tracing::{debug, info, warn};

use crate::domain::{Decimal, ExchangeName, Trade};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trade store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("trade store encoding: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("trade id:{id} not found")]
    NotFound { id: i64 },
}

/// Which account mode a trade was executed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarginMode {
    pub is_margin: bool,
    pub is_isolated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ordering {
    #[default]
    Asc,
    Desc,
}

/// Filter for [`TradeStore::query`]. Empty fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct QueryTradesOptions {
    pub exchange: Option<ExchangeName>,
    pub symbol: Option<String>,
    /// Cursor: `gid > last_gid` ascending, `gid < last_gid` descending.
    pub last_gid: i64,
    pub ordering: Ordering,
    pub limit: usize,
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Newest-first (by gid) trades of one exchange/symbol/margin mode.
    async fn query_last(
        &self,
        exchange: &ExchangeName,
        symbol: &str,
        mode: MarginMode,
        limit: usize,
    ) -> Result<Vec<Trade>, StoreError>;

    async fn query(&self, options: &QueryTradesOptions) -> Result<Vec<Trade>, StoreError>;

    /// Trades of `symbol` plus every trade that paid fees in `fee_currency`, oldest first.
    async fn query_for_trading_fee_currency(
        &self,
        exchange: &ExchangeName,
        symbol: &str,
        fee_currency: &str,
    ) -> Result<Vec<Trade>, StoreError>;

    async fn load(&self, id: i64) -> Result<Trade, StoreError>;

    /// Inserts the trade unless it is already stored. Returns whether it was new.
    async fn insert(&self, trade: &Trade) -> Result<bool, StoreError>;

    /// Attributes a stored trade to a strategy.
    async fn mark(&self, id: i64, strategy_id: &str) -> Result<(), StoreError>;

    async fn update_pnl(&self, id: i64, pnl: Decimal) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory table shared by both stores
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TradeTable {
    rows: Vec<Trade>,
    next_gid: i64,
}

impl TradeTable {
    fn contains(&self, t: &Trade) -> bool {
        self.rows.iter().any(|r| {
            r.id == t.id && r.side == t.side && r.exchange == t.exchange && r.symbol == t.symbol
        })
    }

    /// Row (with the next gid) to store when the trade is new. Nothing is
    /// changed until [`TradeTable::commit`].
    fn stage(&self, trade: &Trade) -> Option<Trade> {
        if self.contains(trade) {
            return None;
        }
        let mut row = trade.clone();
        row.gid = self.next_gid + 1;
        Some(row)
    }

    fn commit(&mut self, row: Trade) {
        self.next_gid = self.next_gid.max(row.gid);
        self.rows.push(row);
    }

    /// Replay path: keeps the journaled gid, drops repeated insert lines.
    fn restore(&mut self, row: Trade) {
        if !self.contains(&row) {
            self.commit(row);
        }
    }

    fn has_id(&self, id: i64) -> bool {
        self.rows.iter().any(|r| r.id == id)
    }

    fn find(&self, id: i64) -> Result<&Trade, StoreError> {
        self.rows.iter().find(|r| r.id == id).ok_or(StoreError::NotFound { id })
    }

    /// Applies `f` to every row with venue id `id` (ids repeat across symbols).
    fn annotate(&mut self, id: i64, f: impl Fn(&mut Trade)) -> Result<(), StoreError> {
        let mut found = false;
        for r in self.rows.iter_mut().filter(|r| r.id == id) {
            f(r);
            found = true;
        }
        if found { Ok(()) } else { Err(StoreError::NotFound { id }) }
    }

    fn query_last(&self, exchange: &ExchangeName, symbol: &str, mode: MarginMode, limit: usize) -> Vec<Trade> {
        // rows are kept in gid order
        self.rows
            .iter()
            .rev()
            .filter(|r| {
                &r.exchange == exchange
                    && r.symbol == symbol
                    && r.is_margin == mode.is_margin
                    && r.is_isolated == mode.is_isolated
            })
            .take(limit)
            .cloned()
            .collect()
    }

    fn query(&self, o: &QueryTradesOptions) -> Vec<Trade> {
        let matches = |r: &&Trade| {
            o.exchange.as_ref().map_or(true, |e| &r.exchange == e)
                && o.symbol.as_deref().map_or(true, |s| r.symbol == s)
                && (o.last_gid <= 0
                    || match o.ordering {
                        Ordering::Asc => r.gid > o.last_gid,
                        Ordering::Desc => r.gid < o.last_gid,
                    })
        };
        let limit = if o.limit == 0 { usize::MAX } else { o.limit };
        match o.ordering {
            Ordering::Asc => self.rows.iter().filter(matches).take(limit).cloned().collect(),
            Ordering::Desc => self.rows.iter().rev().filter(matches).take(limit).cloned().collect(),
        }
    }

    fn query_for_fee_currency(&self, exchange: &ExchangeName, symbol: &str, fee_currency: &str) -> Vec<Trade> {
        let mut out: Vec<Trade> = self
            .rows
            .iter()
            .filter(|r| &r.exchange == exchange && (r.symbol == symbol || r.fee_currency == fee_currency))
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.time, r.gid));
        out
    }
}

// ---------------------------------------------------------------------------
// MemoryTradeStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    table: Mutex<TradeTable>,
}

impl MemoryTradeStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.table.lock().rows.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn all(&self) -> Vec<Trade> { self.table.lock().rows.clone() }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn query_last(&self, exchange: &ExchangeName, symbol: &str, mode: MarginMode, limit: usize) -> Result<Vec<Trade>, StoreError> {
        Ok(self.table.lock().query_last(exchange, symbol, mode, limit))
    }

    async fn query(&self, options: &QueryTradesOptions) -> Result<Vec<Trade>, StoreError> {
        Ok(self.table.lock().query(options))
    }

    async fn query_for_trading_fee_currency(&self, exchange: &ExchangeName, symbol: &str, fee_currency: &str) -> Result<Vec<Trade>, StoreError> {
        Ok(self.table.lock().query_for_fee_currency(exchange, symbol, fee_currency))
    }

    async fn load(&self, id: i64) -> Result<Trade, StoreError> {
        self.table.lock().find(id).cloned()
    }

    async fn insert(&self, trade: &Trade) -> Result<bool, StoreError> {
        let mut table = self.table.lock();
        match table.stage(trade) {
            Some(row) => {
                table.commit(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark(&self, id: i64, strategy_id: &str) -> Result<(), StoreError> {
        self.table.lock().annotate(id, |t| t.strategy_id = Some(strategy_id.to_string()))
    }

    async fn update_pnl(&self, id: i64, pnl: Decimal) -> Result<(), StoreError> {
        self.table.lock().annotate(id, |t| t.pnl = Some(pnl))
    }
}

// ---------------------------------------------------------------------------
// JsonlTradeStore
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Insert { trade: Trade },
    Mark { id: i64, strategy_id: String },
    Pnl { id: i64, pnl: Decimal },
}

/// Append handle of the journal.
struct Journal {
    out: BufWriter<File>,
    /// Last write failed; the file may end in a partial line.
    torn: bool,
}

pub struct JsonlTradeStore {
    path: PathBuf,
    table: Mutex<TradeTable>,
    journal: tokio::sync::Mutex<Journal>,
}

async fn open_writer(path: &Path) -> Result<BufWriter<File>, StoreError> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn replay(path: &Path) -> Result<TradeTable, StoreError> {
    let mut table = TradeTable::default();
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(table),
        Err(e) => return Err(e.into()),
    };

    let mut lines = BufReader::new(file).lines();
    let mut n: usize = 0;
    while let Some(line) = lines.next_line().await? {
        n += 1;
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                // baris terakhir bisa terpotong kalau proses mati saat menulis
                warn!(?e, line = n, path = %path.display(), "trade store: skip unreadable journal line");
                continue;
            }
        };
        match entry {
            JournalEntry::Insert { trade } => table.restore(trade),
            JournalEntry::Mark { id, strategy_id } => {
                let _ = table.annotate(id, |t| t.strategy_id = Some(strategy_id.clone()));
            }
            JournalEntry::Pnl { id, pnl } => {
                let _ = table.annotate(id, |t| t.pnl = Some(pnl));
            }
        }
    }
    Ok(table)
}

impl JsonlTradeStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let table = replay(&path).await?;
        info!(path = %path.display(), trades = table.rows.len(), "trade store: opened");
        let out = open_writer(&path).await?;
        Ok(Self { path, table: Mutex::new(table), journal: tokio::sync::Mutex::new(Journal { out, torn: false }) })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn len(&self) -> usize { self.table.lock().rows.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Writes one journal line. The in-memory table is only touched by the
    /// caller after this returns `Ok`, so a failed write leaves no trace.
    async fn append(&self, journal: &mut Journal, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut line = Vec::new();
        if journal.torn {
            // close a partial line left by the failed write
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, entry)?;
        line.push(b'\n');

        match write_line(&mut journal.out, &line).await {
            Ok(()) => {
                journal.torn = false;
                Ok(())
            }
            Err(e) => {
                warn!(?e, path = %self.path.display(), "trade store: journal write failed");
                journal.torn = true;
                // buang buffer yang gagal di-flush, tulis ulang lewat handle baru
                match open_writer(&self.path).await {
                    Ok(out) => journal.out = out,
                    Err(reopen) => warn!(e = ?reopen, "trade store: reopen journal failed"),
                }
                Err(e.into())
            }
        }
    }
}

async fn write_line(out: &mut BufWriter<File>, line: &[u8]) -> std::io::Result<()> {
    out.write_all(line).await?;
    out.flush().await
}

#[async_trait]
impl TradeStore for JsonlTradeStore {
    async fn query_last(&self, exchange: &ExchangeName, symbol: &str, mode: MarginMode, limit: usize) -> Result<Vec<Trade>, StoreError> {
        debug!(%exchange, %symbol, is_margin = mode.is_margin, is_isolated = mode.is_isolated, "querying last trades");
        Ok(self.table.lock().query_last(exchange, symbol, mode, limit))
    }

    async fn query(&self, options: &QueryTradesOptions) -> Result<Vec<Trade>, StoreError> {
        Ok(self.table.lock().query(options))
    }

    async fn query_for_trading_fee_currency(&self, exchange: &ExchangeName, symbol: &str, fee_currency: &str) -> Result<Vec<Trade>, StoreError> {
        Ok(self.table.lock().query_for_fee_currency(exchange, symbol, fee_currency))
    }

    async fn load(&self, id: i64) -> Result<Trade, StoreError> {
        self.table.lock().find(id).cloned()
    }

    async fn insert(&self, trade: &Trade) -> Result<bool, StoreError> {
        // The journal lock serializes stage -> write -> commit, so two inserts
        // of the same trade cannot both reach the journal.
        let mut journal = self.journal.lock().await;
        let staged = self.table.lock().stage(trade);
        let Some(row) = staged else { return Ok(false) };
        self.append(&mut journal, &JournalEntry::Insert { trade: row.clone() }).await?;
        self.table.lock().commit(row);
        Ok(true)
    }

    async fn mark(&self, id: i64, strategy_id: &str) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        let known = self.table.lock().has_id(id);
        if !known {
            return Err(StoreError::NotFound { id });
        }
        self.append(&mut journal, &JournalEntry::Mark { id, strategy_id: strategy_id.to_string() }).await?;
        self.table.lock().annotate(id, |t| t.strategy_id = Some(strategy_id.to_string()))
    }

    async fn update_pnl(&self, id: i64, pnl: Decimal) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        let known = self.table.lock().has_id(id);
        if !known {
            return Err(StoreError::NotFound { id });
        }
        self.append(&mut journal, &JournalEntry::Pnl { id, pnl }).await?;
        self.table.lock().annotate(id, |t| t.pnl = Some(pnl))
    }
}
