//! PostgreSQL sync store backend.
//!
//! Mirrors [`crate::sqlite::SqliteSyncStore`] with Postgres types: 256-bit
//! quantities live in `NUMERIC(78,0)` columns (bound as decimal strings,
//! read back via `::text`), and insert-or-ignore is `ON CONFLICT DO NOTHING`.

use alloy_primitives::U256;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use chainflow_core::checkpoint::Checkpoint;
use chainflow_core::filter::{ChildAddressLocation, FactoryCriteria, LogFilterCriteria};
use chainflow_core::interval::{interval_intersection_many, interval_union, Interval};
use chainflow_core::types::{normalize_hex, Block, Log, Transaction};

use crate::metrics::StoreMetrics;
use crate::retry::with_retry;
use crate::{
    FunctionMetadata, GetLogEventsArgs, LogEvent, LogEventPage, StoreError, SyncStore,
};

/// Postgres-backed sync store.
///
/// Thread-safe and cheaply cloneable — wraps a connection pool internally.
#[derive(Clone)]
pub struct PostgresSyncStore {
    pool: PgPool,
    metrics: StoreMetrics,
}

impl PostgresSyncStore {
    /// Connect and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("postgres connect: {e}")))?;
        let store = Self {
            pool,
            metrics: StoreMetrics::default(),
        };
        store.init_schema().await?;
        info!("PostgresSyncStore connected and schema initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS blocks (
                chain_id                 BIGINT NOT NULL,
                hash                     TEXT   NOT NULL,
                parent_hash              TEXT   NOT NULL,
                number                   BIGINT NOT NULL,
                timestamp                BIGINT NOT NULL,
                miner                    TEXT   NOT NULL,
                gas_limit                NUMERIC(78,0) NOT NULL,
                gas_used                 NUMERIC(78,0) NOT NULL,
                base_fee_per_gas         NUMERIC(78,0),
                size                     NUMERIC(78,0) NOT NULL,
                total_difficulty         NUMERIC(78,0),
                state_root               TEXT   NOT NULL,
                transactions_root        TEXT   NOT NULL,
                receipts_root            TEXT   NOT NULL,
                logs_bloom               TEXT   NOT NULL,
                extra_data               TEXT   NOT NULL,
                PRIMARY KEY (chain_id, hash)
            );",
            "CREATE INDEX IF NOT EXISTS blocks_number_idx
                ON blocks (chain_id, number);",
            "CREATE TABLE IF NOT EXISTS transactions (
                chain_id                 BIGINT NOT NULL,
                hash                     TEXT   NOT NULL,
                block_hash               TEXT   NOT NULL,
                block_number             BIGINT NOT NULL,
                transaction_index        INTEGER NOT NULL,
                from_address             TEXT   NOT NULL,
                to_address               TEXT,
                value                    NUMERIC(78,0) NOT NULL,
                gas                      NUMERIC(78,0) NOT NULL,
                gas_price                NUMERIC(78,0),
                max_fee_per_gas          NUMERIC(78,0),
                max_priority_fee_per_gas NUMERIC(78,0),
                input                    TEXT   NOT NULL,
                nonce                    BIGINT NOT NULL,
                PRIMARY KEY (chain_id, hash)
            );",
            "CREATE INDEX IF NOT EXISTS transactions_block_number_idx
                ON transactions (chain_id, block_number);",
            "CREATE TABLE IF NOT EXISTS logs (
                id                TEXT    NOT NULL PRIMARY KEY,
                chain_id          BIGINT  NOT NULL,
                block_hash        TEXT    NOT NULL,
                block_number      BIGINT  NOT NULL,
                log_index         INTEGER NOT NULL,
                transaction_hash  TEXT    NOT NULL,
                transaction_index INTEGER NOT NULL,
                address           TEXT    NOT NULL,
                topic0            TEXT,
                topic1            TEXT,
                topic2            TEXT,
                topic3            TEXT,
                data              TEXT    NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS logs_block_number_idx
                ON logs (chain_id, block_number);",
            "CREATE INDEX IF NOT EXISTS logs_address_idx ON logs (address);",
            "CREATE INDEX IF NOT EXISTS logs_topic0_idx ON logs (topic0);",
            "CREATE INDEX IF NOT EXISTS logs_topic1_idx ON logs (topic1);",
            "CREATE INDEX IF NOT EXISTS logs_topic2_idx ON logs (topic2);",
            "CREATE INDEX IF NOT EXISTS logs_topic3_idx ON logs (topic3);",
            "CREATE TABLE IF NOT EXISTS log_filters (
                id       TEXT   NOT NULL PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                address  TEXT,
                topic0   TEXT,
                topic1   TEXT,
                topic2   TEXT,
                topic3   TEXT
            );",
            "CREATE TABLE IF NOT EXISTS log_filter_intervals (
                id            BIGSERIAL PRIMARY KEY,
                log_filter_id TEXT   NOT NULL,
                start_block   BIGINT NOT NULL,
                end_block     BIGINT NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS log_filter_intervals_filter_idx
                ON log_filter_intervals (log_filter_id);",
            "CREATE TABLE IF NOT EXISTS factories (
                id                     TEXT   NOT NULL PRIMARY KEY,
                chain_id               BIGINT NOT NULL,
                address                TEXT   NOT NULL,
                event_selector         TEXT   NOT NULL,
                child_address_location TEXT   NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS factory_log_filter_intervals (
                id          BIGSERIAL PRIMARY KEY,
                factory_id  TEXT   NOT NULL,
                start_block BIGINT NOT NULL,
                end_block   BIGINT NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS factory_log_filter_intervals_factory_idx
                ON factory_log_filter_intervals (factory_id);",
            "CREATE TABLE IF NOT EXISTS rpc_request_results (
                chain_id     BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                request      TEXT   NOT NULL,
                result       TEXT   NOT NULL,
                PRIMARY KEY (chain_id, block_number, request)
            );",
            "CREATE TABLE IF NOT EXISTS function_metadata (
                function_id     TEXT   NOT NULL PRIMARY KEY,
                function_name   TEXT   NOT NULL,
                from_checkpoint TEXT   NOT NULL,
                to_checkpoint   TEXT   NOT NULL,
                event_count     BIGINT NOT NULL
            );",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(StoreError::db)?;
        }
        Ok(())
    }

    // ─── Row upserts ─────────────────────────────────────────────────────────

    async fn upsert_block(
        conn: &mut PgConnection,
        chain_id: u64,
        block: &Block,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO blocks
             (chain_id, hash, parent_hash, number, timestamp, miner, gas_limit,
              gas_used, base_fee_per_gas, size, total_difficulty, state_root,
              transactions_root, receipts_root, logs_bloom, extra_data)
             VALUES ($1, $2, $3, $4, $5, $6, $7::numeric, $8::numeric,
                     $9::numeric, $10::numeric, $11::numeric, $12, $13, $14, $15, $16)
             ON CONFLICT (chain_id, hash) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(&block.hash)
        .bind(&block.parent_hash)
        .bind(block.number as i64)
        .bind(block.timestamp as i64)
        .bind(&block.miner)
        .bind(block.gas_limit.to_string())
        .bind(block.gas_used.to_string())
        .bind(block.base_fee_per_gas.map(|v| v.to_string()))
        .bind(block.size.to_string())
        .bind(block.total_difficulty.map(|v| v.to_string()))
        .bind(&block.state_root)
        .bind(&block.transactions_root)
        .bind(&block.receipts_root)
        .bind(&block.logs_bloom)
        .bind(&block.extra_data)
        .execute(conn)
        .await
        .map_err(StoreError::db)?;
        Ok(())
    }

    async fn upsert_transaction(
        conn: &mut PgConnection,
        chain_id: u64,
        tx: &Transaction,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO transactions
             (chain_id, hash, block_hash, block_number, transaction_index,
              from_address, to_address, value, gas, gas_price, max_fee_per_gas,
              max_priority_fee_per_gas, input, nonce)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8::numeric, $9::numeric,
                     $10::numeric, $11::numeric, $12::numeric, $13, $14)
             ON CONFLICT (chain_id, hash) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(&tx.hash)
        .bind(&tx.block_hash)
        .bind(tx.block_number as i64)
        .bind(tx.transaction_index as i32)
        .bind(&tx.from)
        .bind(tx.to.as_deref())
        .bind(tx.value.to_string())
        .bind(tx.gas.to_string())
        .bind(tx.gas_price.map(|v| v.to_string()))
        .bind(tx.max_fee_per_gas.map(|v| v.to_string()))
        .bind(tx.max_priority_fee_per_gas.map(|v| v.to_string()))
        .bind(&tx.input)
        .bind(tx.nonce as i64)
        .execute(conn)
        .await
        .map_err(StoreError::db)?;
        Ok(())
    }

    async fn upsert_log(
        conn: &mut PgConnection,
        chain_id: u64,
        log: &Log,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO logs
             (id, chain_id, block_hash, block_number, log_index,
              transaction_hash, transaction_index, address,
              topic0, topic1, topic2, topic3, data)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(log.log_id(chain_id))
        .bind(chain_id as i64)
        .bind(&log.block_hash)
        .bind(log.block_number as i64)
        .bind(log.log_index as i32)
        .bind(&log.transaction_hash)
        .bind(log.transaction_index as i32)
        .bind(normalize_hex(&log.address))
        .bind(log.topic(0).map(normalize_hex))
        .bind(log.topic(1).map(normalize_hex))
        .bind(log.topic(2).map(normalize_hex))
        .bind(log.topic(3).map(normalize_hex))
        .bind(&log.data)
        .execute(conn)
        .await
        .map_err(StoreError::db)?;
        Ok(())
    }

    async fn upsert_chain_data(
        conn: &mut PgConnection,
        chain_id: u64,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
    ) -> Result<(), StoreError> {
        Self::upsert_block(conn, chain_id, block).await?;
        for tx in transactions {
            Self::upsert_transaction(conn, chain_id, tx).await?;
        }
        for log in logs {
            Self::upsert_log(conn, chain_id, log).await?;
        }
        Ok(())
    }

    // ─── Interval bookkeeping ────────────────────────────────────────────────

    async fn append_log_filter_fragment_interval(
        conn: &mut PgConnection,
        fragment: &chainflow_core::filter::LogFilterFragment,
        interval: Interval,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO log_filters
             (id, chain_id, address, topic0, topic1, topic2, topic3)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&fragment.id)
        .bind(fragment.chain_id as i64)
        .bind(fragment.address.as_deref())
        .bind(fragment.topic0.as_deref())
        .bind(fragment.topic1.as_deref())
        .bind(fragment.topic2.as_deref())
        .bind(fragment.topic3.as_deref())
        .execute(&mut *conn)
        .await
        .map_err(StoreError::db)?;

        sqlx::query(
            "INSERT INTO log_filter_intervals (log_filter_id, start_block, end_block)
             VALUES ($1, $2, $3)",
        )
        .bind(&fragment.id)
        .bind(interval.start_block as i64)
        .bind(interval.end_block as i64)
        .execute(conn)
        .await
        .map_err(StoreError::db)?;
        Ok(())
    }

    async fn append_factory_interval(
        conn: &mut PgConnection,
        chain_id: u64,
        factory: &FactoryCriteria,
        interval: Interval,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO factories
             (id, chain_id, address, event_selector, child_address_location)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(factory.fragment_id(chain_id))
        .bind(chain_id as i64)
        .bind(normalize_hex(&factory.address))
        .bind(normalize_hex(&factory.event_selector))
        .bind(factory.child_address_location.to_string())
        .execute(&mut *conn)
        .await
        .map_err(StoreError::db)?;

        sqlx::query(
            "INSERT INTO factory_log_filter_intervals (factory_id, start_block, end_block)
             VALUES ($1, $2, $3)",
        )
        .bind(factory.fragment_id(chain_id))
        .bind(interval.start_block as i64)
        .bind(interval.end_block as i64)
        .execute(conn)
        .await
        .map_err(StoreError::db)?;
        Ok(())
    }

    async fn compact_intervals(
        &self,
        table: &str,
        key_column: &str,
        fragment_id: &str,
    ) -> Result<Vec<Interval>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::db)?;

        let rows = sqlx::query(&format!(
            "SELECT start_block, end_block FROM {table} WHERE {key_column} = $1"
        ))
        .bind(fragment_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::db)?;

        let intervals: Vec<Interval> = rows
            .iter()
            .map(|row| {
                Interval::new(
                    row.get::<i64, _>("start_block") as u64,
                    row.get::<i64, _>("end_block") as u64,
                )
            })
            .collect();
        let union = interval_union(&intervals);

        if union.len() < intervals.len() {
            sqlx::query(&format!("DELETE FROM {table} WHERE {key_column} = $1"))
                .bind(fragment_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::db)?;
            for iv in &union {
                sqlx::query(&format!(
                    "INSERT INTO {table} ({key_column}, start_block, end_block)
                     VALUES ($1, $2, $3)"
                ))
                .bind(fragment_id)
                .bind(iv.start_block as i64)
                .bind(iv.end_block as i64)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::db)?;
            }
        }

        tx.commit().await.map_err(StoreError::db)?;
        Ok(union)
    }

    // ─── Event query assembly ────────────────────────────────────────────────

    fn events_query<'a>(
        &self,
        args: &'a GetLogEventsArgs,
        newest_only: bool,
    ) -> QueryBuilder<'a, Postgres> {
        let mut qb = QueryBuilder::new(
            "SELECT l.chain_id AS log_chain_id, l.address AS log_address,
                    l.block_hash AS log_block_hash, l.block_number AS log_block_number,
                    l.log_index AS log_index, l.transaction_hash AS log_transaction_hash,
                    l.transaction_index AS log_transaction_index, l.data AS log_data,
                    l.topic0, l.topic1, l.topic2, l.topic3,
                    b.number AS block_number, b.hash AS block_hash,
                    b.parent_hash AS block_parent_hash, b.timestamp AS block_timestamp,
                    b.miner AS block_miner, b.gas_limit::text AS block_gas_limit,
                    b.gas_used::text AS block_gas_used,
                    b.base_fee_per_gas::text AS block_base_fee_per_gas,
                    b.size::text AS block_size,
                    b.total_difficulty::text AS block_total_difficulty,
                    b.state_root AS block_state_root, b.transactions_root AS block_transactions_root,
                    b.receipts_root AS block_receipts_root, b.logs_bloom AS block_logs_bloom,
                    b.extra_data AS block_extra_data,
                    t.hash AS tx_hash, t.block_hash AS tx_block_hash,
                    t.block_number AS tx_block_number, t.transaction_index AS tx_transaction_index,
                    t.from_address AS tx_from, t.to_address AS tx_to, t.value::text AS tx_value,
                    t.gas::text AS tx_gas, t.gas_price::text AS tx_gas_price,
                    t.max_fee_per_gas::text AS tx_max_fee_per_gas,
                    t.max_priority_fee_per_gas::text AS tx_max_priority_fee_per_gas,
                    t.input AS tx_input, t.nonce AS tx_nonce
             FROM logs l
             JOIN blocks b ON b.chain_id = l.chain_id AND b.hash = l.block_hash
             JOIN transactions t ON t.chain_id = l.chain_id AND t.hash = l.transaction_hash
             WHERE (",
        );

        let mut first = true;
        for filter in &args.log_filters {
            if !first {
                qb.push(" OR ");
            }
            first = false;
            qb.push("(l.chain_id = ");
            qb.push_bind(filter.chain_id as i64);
            push_in_clause(&mut qb, "l.address", &filter.criteria.address);
            push_in_clause(&mut qb, "l.topic0", &filter.criteria.topic0);
            push_in_clause(&mut qb, "l.topic1", &filter.criteria.topic1);
            push_in_clause(&mut qb, "l.topic2", &filter.criteria.topic2);
            push_in_clause(&mut qb, "l.topic3", &filter.criteria.topic3);
            push_in_clause(&mut qb, "l.topic0", &filter.include_event_selectors);
            push_block_range(&mut qb, filter.from_block, filter.to_block);
            qb.push(")");
        }
        for factory in &args.factories {
            if !first {
                qb.push(" OR ");
            }
            first = false;
            qb.push("(l.chain_id = ");
            qb.push_bind(factory.chain_id as i64);
            qb.push(" AND l.address IN (SELECT ");
            qb.push(child_address_expr(&factory.criteria.child_address_location));
            qb.push(" FROM logs cl WHERE cl.chain_id = ");
            qb.push_bind(factory.chain_id as i64);
            qb.push(" AND cl.address = ");
            qb.push_bind(normalize_hex(&factory.criteria.address));
            qb.push(" AND cl.topic0 = ");
            qb.push_bind(normalize_hex(&factory.criteria.event_selector));
            qb.push(")");
            push_in_clause(&mut qb, "l.topic0", &factory.include_event_selectors);
            push_block_range(&mut qb, factory.from_block, factory.to_block);
            qb.push(")");
        }
        if first {
            qb.push("1 = 0");
        }
        qb.push(")");

        qb.push(" AND (b.timestamp, l.chain_id, b.number, l.log_index) > (");
        push_checkpoint_bound(&mut qb, &args.from_checkpoint);
        qb.push(") AND (b.timestamp, l.chain_id, b.number, l.log_index) <= (");
        push_checkpoint_bound(&mut qb, &args.to_checkpoint);
        qb.push(")");

        if newest_only {
            qb.push(
                " ORDER BY b.timestamp DESC, l.chain_id DESC, b.number DESC, l.log_index DESC \
                 LIMIT 1",
            );
        } else {
            qb.push(" ORDER BY b.timestamp ASC, l.chain_id ASC, b.number ASC, l.log_index ASC");
        }
        qb
    }

    async fn get_log_events_inner(
        &self,
        args: &GetLogEventsArgs,
    ) -> Result<LogEventPage, StoreError> {
        let mut qb = self.events_query(args, false);
        qb.push(" LIMIT ");
        qb.push_bind((args.limit + 1) as i64);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::db)?;

        let mut events = rows
            .iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>, _>>()?;
        let has_next_page = events.len() > args.limit;
        events.truncate(args.limit);
        let last_checkpoint_in_page = events.last().map(|e| e.checkpoint);

        let last_checkpoint = self
            .events_query(args, true)
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::db)?
            .as_ref()
            .map(row_to_event)
            .transpose()?
            .map(|e| e.checkpoint);

        debug!(
            events = events.len(),
            has_next_page, "served log event page"
        );
        Ok(LogEventPage {
            events,
            has_next_page,
            last_checkpoint_in_page,
            last_checkpoint,
        })
    }

    async fn delete_realtime_data_inner(
        &self,
        chain_id: u64,
        from_block: u64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::db)?;
        let chain = chain_id as i64;
        let block = from_block as i64;

        for sql in [
            "DELETE FROM blocks WHERE chain_id = $1 AND number > $2",
            "DELETE FROM transactions WHERE chain_id = $1 AND block_number > $2",
            "DELETE FROM logs WHERE chain_id = $1 AND block_number > $2",
            "DELETE FROM rpc_request_results WHERE chain_id = $1 AND block_number > $2",
        ] {
            sqlx::query(sql)
                .bind(chain)
                .bind(block)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::db)?;
        }

        for (intervals, filters, key) in [
            ("log_filter_intervals", "log_filters", "log_filter_id"),
            (
                "factory_log_filter_intervals",
                "factories",
                "factory_id",
            ),
        ] {
            sqlx::query(&format!(
                "DELETE FROM {intervals} WHERE start_block > $1
                 AND {key} IN (SELECT id FROM {filters} WHERE chain_id = $2)"
            ))
            .bind(block)
            .bind(chain)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::db)?;

            sqlx::query(&format!(
                "UPDATE {intervals} SET end_block = $1 WHERE end_block > $1
                 AND {key} IN (SELECT id FROM {filters} WHERE chain_id = $2)"
            ))
            .bind(block)
            .bind(chain)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::db)?;
        }

        tx.commit().await.map_err(StoreError::db)
    }
}

fn push_in_clause(qb: &mut QueryBuilder<'_, Postgres>, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(normalize_hex(value));
    }
    qb.push(")");
}

fn push_block_range(qb: &mut QueryBuilder<'_, Postgres>, from: Option<u64>, to: Option<u64>) {
    if let Some(from) = from {
        qb.push(" AND b.number >= ");
        qb.push_bind(from as i64);
    }
    if let Some(to) = to {
        qb.push(" AND b.number <= ");
        qb.push_bind(to as i64);
    }
}

fn push_checkpoint_bound(qb: &mut QueryBuilder<'_, Postgres>, checkpoint: &Checkpoint) {
    qb.push_bind(checkpoint.block_timestamp as i64);
    qb.push(", ");
    qb.push_bind(checkpoint.chain_id as i64);
    qb.push(", ");
    qb.push_bind(checkpoint.block_number as i64);
    qb.push(", ");
    qb.push_bind(match checkpoint.log_index {
        Some(i) => i as i64,
        None => i64::MAX,
    });
}

fn child_address_expr(location: &ChildAddressLocation) -> String {
    match location {
        ChildAddressLocation::Topic(slot) => format!("'0x' || substr(cl.topic{slot}, 27)"),
        ChildAddressLocation::Offset(offset) => {
            format!("'0x' || substr(cl.data, {}, 40)", 3 + 2 * (12 + offset))
        }
    }
}

fn parse_numeric(s: &str) -> Result<U256, StoreError> {
    U256::from_str_radix(s, 10).map_err(|e| StoreError::Encoding(format!("bad numeric '{s}': {e}")))
}

fn row_to_event(row: &PgRow) -> Result<LogEvent, StoreError> {
    let opt_u256 = |column: &str| -> Result<Option<_>, StoreError> {
        row.get::<Option<String>, _>(column)
            .map(|s| parse_numeric(&s))
            .transpose()
    };

    let chain_id = row.get::<i64, _>("log_chain_id") as u64;
    let block = Block {
        number: row.get::<i64, _>("block_number") as u64,
        hash: row.get("block_hash"),
        parent_hash: row.get("block_parent_hash"),
        timestamp: row.get::<i64, _>("block_timestamp") as u64,
        miner: row.get("block_miner"),
        gas_limit: parse_numeric(&row.get::<String, _>("block_gas_limit"))?,
        gas_used: parse_numeric(&row.get::<String, _>("block_gas_used"))?,
        base_fee_per_gas: opt_u256("block_base_fee_per_gas")?,
        size: parse_numeric(&row.get::<String, _>("block_size"))?,
        total_difficulty: opt_u256("block_total_difficulty")?,
        state_root: row.get("block_state_root"),
        transactions_root: row.get("block_transactions_root"),
        receipts_root: row.get("block_receipts_root"),
        logs_bloom: row.get("block_logs_bloom"),
        extra_data: row.get("block_extra_data"),
    };
    let transaction = Transaction {
        hash: row.get("tx_hash"),
        block_hash: row.get("tx_block_hash"),
        block_number: row.get::<i64, _>("tx_block_number") as u64,
        transaction_index: row.get::<i32, _>("tx_transaction_index") as u32,
        from: row.get("tx_from"),
        to: row.get("tx_to"),
        value: parse_numeric(&row.get::<String, _>("tx_value"))?,
        gas: parse_numeric(&row.get::<String, _>("tx_gas"))?,
        gas_price: opt_u256("tx_gas_price")?,
        max_fee_per_gas: opt_u256("tx_max_fee_per_gas")?,
        max_priority_fee_per_gas: opt_u256("tx_max_priority_fee_per_gas")?,
        input: row.get("tx_input"),
        nonce: row.get::<i64, _>("tx_nonce") as u64,
    };
    let topics: Vec<String> = [
        row.get::<Option<String>, _>("topic0"),
        row.get::<Option<String>, _>("topic1"),
        row.get::<Option<String>, _>("topic2"),
        row.get::<Option<String>, _>("topic3"),
    ]
    .into_iter()
    .flatten()
    .collect();
    let log = Log {
        address: row.get("log_address"),
        block_hash: row.get("log_block_hash"),
        block_number: row.get::<i64, _>("log_block_number") as u64,
        log_index: row.get::<i32, _>("log_index") as u32,
        transaction_hash: row.get("log_transaction_hash"),
        transaction_index: row.get::<i32, _>("log_transaction_index") as u32,
        data: row.get("log_data"),
        topics,
    };
    let checkpoint = Checkpoint::of_log(block.timestamp, chain_id, block.number, log.log_index);
    Ok(LogEvent {
        chain_id,
        log,
        block,
        transaction,
        checkpoint,
    })
}

#[async_trait]
impl SyncStore for PostgresSyncStore {
    async fn insert_log_filter_interval(
        &self,
        chain_id: u64,
        filter: &LogFilterCriteria,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
        interval: Interval,
    ) -> Result<(), StoreError> {
        with_retry(&self.metrics, "insert_log_filter_interval", || async {
            let mut tx = self.pool.begin().await.map_err(StoreError::db)?;
            Self::upsert_chain_data(&mut tx, chain_id, block, transactions, logs).await?;
            for fragment in filter.fragments(chain_id) {
                Self::append_log_filter_fragment_interval(&mut tx, &fragment, interval).await?;
            }
            tx.commit().await.map_err(StoreError::db)
        })
        .await
    }

    async fn get_log_filter_intervals(
        &self,
        chain_id: u64,
        filter: &LogFilterCriteria,
    ) -> Result<Vec<Interval>, StoreError> {
        with_retry(&self.metrics, "get_log_filter_intervals", || async {
            let mut unions = Vec::new();
            for fragment in filter.fragments(chain_id) {
                unions.push(
                    self.compact_intervals("log_filter_intervals", "log_filter_id", &fragment.id)
                        .await?,
                );
            }
            Ok(interval_intersection_many(&unions))
        })
        .await
    }

    async fn insert_factory_log_filter_interval(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
        interval: Interval,
    ) -> Result<(), StoreError> {
        with_retry(&self.metrics, "insert_factory_log_filter_interval", || async {
            let mut tx = self.pool.begin().await.map_err(StoreError::db)?;
            Self::upsert_chain_data(&mut tx, chain_id, block, transactions, logs).await?;
            Self::append_factory_interval(&mut tx, chain_id, factory, interval).await?;
            tx.commit().await.map_err(StoreError::db)
        })
        .await
    }

    async fn get_factory_log_filter_intervals(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
    ) -> Result<Vec<Interval>, StoreError> {
        with_retry(&self.metrics, "get_factory_log_filter_intervals", || async {
            self.compact_intervals(
                "factory_log_filter_intervals",
                "factory_id",
                &factory.fragment_id(chain_id),
            )
            .await
        })
        .await
    }

    async fn insert_factory_child_address_logs(
        &self,
        chain_id: u64,
        logs: &[Log],
    ) -> Result<(), StoreError> {
        with_retry(&self.metrics, "insert_factory_child_address_logs", || async {
            let mut tx = self.pool.begin().await.map_err(StoreError::db)?;
            for log in logs {
                Self::upsert_log(&mut tx, chain_id, log).await?;
            }
            tx.commit().await.map_err(StoreError::db)
        })
        .await
    }

    fn get_factory_child_addresses(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
        up_to_block: u64,
        page_size: usize,
    ) -> BoxStream<'static, Result<Vec<String>, StoreError>> {
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT {} AS child FROM logs cl
             WHERE cl.chain_id = $1 AND cl.address = $2 AND cl.topic0 = $3
               AND cl.block_number <= $4
             ORDER BY cl.block_number ASC, cl.log_index ASC
             LIMIT $5 OFFSET $6",
            child_address_expr(&factory.child_address_location)
        );
        let address = normalize_hex(&factory.address);
        let selector = normalize_hex(&factory.event_selector);

        stream::try_unfold((0i64, false), move |(offset, done)| {
            let pool = pool.clone();
            let sql = sql.clone();
            let address = address.clone();
            let selector = selector.clone();
            async move {
                if done {
                    return Ok(None);
                }
                let rows = sqlx::query(&sql)
                    .bind(chain_id as i64)
                    .bind(&address)
                    .bind(&selector)
                    .bind(up_to_block as i64)
                    .bind(page_size as i64)
                    .bind(offset)
                    .fetch_all(&pool)
                    .await
                    .map_err(StoreError::db)?;
                if rows.is_empty() {
                    return Ok(None);
                }
                let page: Vec<String> = rows
                    .iter()
                    .map(|row| row.get::<String, _>("child"))
                    .collect();
                let done = page.len() < page_size;
                let next_offset = offset + page.len() as i64;
                Ok(Some((page, (next_offset, done))))
            }
        })
        .boxed()
    }

    async fn insert_realtime_block(
        &self,
        chain_id: u64,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
    ) -> Result<(), StoreError> {
        with_retry(&self.metrics, "insert_realtime_block", || async {
            let mut tx = self.pool.begin().await.map_err(StoreError::db)?;
            Self::upsert_chain_data(&mut tx, chain_id, block, transactions, logs).await?;
            tx.commit().await.map_err(StoreError::db)
        })
        .await
    }

    async fn insert_realtime_interval(
        &self,
        chain_id: u64,
        log_filters: &[LogFilterCriteria],
        factories: &[FactoryCriteria],
        interval: Interval,
    ) -> Result<(), StoreError> {
        with_retry(&self.metrics, "insert_realtime_interval", || async {
            let mut tx = self.pool.begin().await.map_err(StoreError::db)?;
            for filter in log_filters {
                for fragment in filter.fragments(chain_id) {
                    Self::append_log_filter_fragment_interval(&mut tx, &fragment, interval)
                        .await?;
                }
            }
            for factory in factories {
                Self::append_factory_interval(&mut tx, chain_id, factory, interval).await?;
            }
            tx.commit().await.map_err(StoreError::db)
        })
        .await
    }

    async fn delete_realtime_data(
        &self,
        chain_id: u64,
        from_block: u64,
    ) -> Result<(), StoreError> {
        with_retry(&self.metrics, "delete_realtime_data", || {
            self.delete_realtime_data_inner(chain_id, from_block)
        })
        .await
    }

    async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
        result: &str,
    ) -> Result<(), StoreError> {
        with_retry(&self.metrics, "insert_rpc_request_result", || async {
            sqlx::query(
                "INSERT INTO rpc_request_results (chain_id, block_number, request, result)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (chain_id, block_number, request)
                 DO UPDATE SET result = excluded.result",
            )
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .bind(request)
            .bind(result)
            .execute(&self.pool)
            .await
            .map_err(StoreError::db)?;
            Ok(())
        })
        .await
    }

    async fn get_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
    ) -> Result<Option<String>, StoreError> {
        with_retry(&self.metrics, "get_rpc_request_result", || async {
            let row = sqlx::query(
                "SELECT result FROM rpc_request_results
                 WHERE chain_id = $1 AND block_number = $2 AND request = $3",
            )
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .bind(request)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::db)?;
            Ok(row.map(|r| r.get::<String, _>("result")))
        })
        .await
    }

    async fn get_log_events(&self, args: &GetLogEventsArgs) -> Result<LogEventPage, StoreError> {
        with_retry(&self.metrics, "get_log_events", || {
            self.get_log_events_inner(args)
        })
        .await
    }

    async fn upsert_function_metadata(
        &self,
        rows: &[FunctionMetadata],
    ) -> Result<(), StoreError> {
        with_retry(&self.metrics, "upsert_function_metadata", || async {
            let mut tx = self.pool.begin().await.map_err(StoreError::db)?;
            for row in rows {
                sqlx::query(
                    "INSERT INTO function_metadata
                     (function_id, function_name, from_checkpoint, to_checkpoint, event_count)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (function_id) DO UPDATE SET
                       function_name = excluded.function_name,
                       from_checkpoint = excluded.from_checkpoint,
                       to_checkpoint = excluded.to_checkpoint,
                       event_count = excluded.event_count",
                )
                .bind(&row.function_id)
                .bind(&row.function_name)
                .bind(row.from_checkpoint.encode())
                .bind(row.to_checkpoint.encode())
                .bind(row.event_count as i64)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::db)?;
            }
            tx.commit().await.map_err(StoreError::db)
        })
        .await
    }

    async fn get_function_metadata(
        &self,
        function_ids: &[String],
    ) -> Result<Vec<FunctionMetadata>, StoreError> {
        with_retry(&self.metrics, "get_function_metadata", || async {
            if function_ids.is_empty() {
                return Ok(Vec::new());
            }
            let mut qb = QueryBuilder::<Postgres>::new(
                "SELECT function_id, function_name, from_checkpoint, to_checkpoint, event_count
                 FROM function_metadata WHERE function_id IN (",
            );
            let mut separated = qb.separated(", ");
            for id in function_ids {
                separated.push_bind(id);
            }
            qb.push(")");
            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::db)?;
            rows.iter().map(row_to_function_metadata).collect()
        })
        .await
    }
}

fn row_to_function_metadata(row: &PgRow) -> Result<FunctionMetadata, StoreError> {
    let decode = |column: &str| {
        let encoded = row.get::<String, _>(column);
        Checkpoint::decode(&encoded)
            .ok_or_else(|| StoreError::Encoding(format!("bad checkpoint '{encoded}'")))
    };
    Ok(FunctionMetadata {
        function_id: row.get("function_id"),
        function_name: row.get("function_name"),
        from_checkpoint: decode("from_checkpoint")?,
        to_checkpoint: decode("to_checkpoint")?,
        event_count: row.get::<i64, _>("event_count") as u64,
    })
}
