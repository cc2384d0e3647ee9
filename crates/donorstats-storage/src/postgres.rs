use async_trait::async_trait;
use chrono::NaiveDate;
use donorstats_core::{
    AgreementField, DailyDonorStat, DedupKey, FieldKind, FieldValue, ProductTotal,
    RecordFragment, RegionTotal, StoredAgreement,
};
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};

use crate::{RecordStore, StoreError, StoreResult, StoreSession};

const ROW_SAVEPOINT: &str = "import_row";

/// Record store backed by the `donor_agreements` and `daily_donor_stats` tables.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(
            db.kind(),
            ErrorKind::CheckViolation | ErrorKind::NotNullViolation | ErrorKind::UniqueViolation
        ) {
            return StoreError::Constraint(db.message().to_string());
        }
    }
    StoreError::Database(err)
}

fn push_value(builder: &mut QueryBuilder<'_, Postgres>, field: AgreementField, value: Option<&FieldValue>) {
    match field.kind() {
        FieldKind::Integer => builder.push_bind(value.and_then(FieldValue::as_integer)),
        FieldKind::Float => builder.push_bind(value.and_then(FieldValue::as_float)),
        FieldKind::Date => builder.push_bind(value.and_then(FieldValue::as_date)),
        FieldKind::Text => builder.push_bind(value.and_then(FieldValue::as_text).map(str::to_string)),
    };
}

fn decode_agreement(row: &PgRow) -> Result<StoredAgreement, sqlx::Error> {
    let mut fields = RecordFragment::new();
    for field in AgreementField::ALL {
        let column = field.column();
        let value = match field.kind() {
            FieldKind::Integer => row.try_get::<Option<i64>, _>(column)?.map(FieldValue::Integer),
            FieldKind::Float => row.try_get::<Option<f64>, _>(column)?.map(FieldValue::Float),
            FieldKind::Date => row.try_get::<Option<NaiveDate>, _>(column)?.map(FieldValue::Date),
            FieldKind::Text => row.try_get::<Option<String>, _>(column)?.map(FieldValue::Text),
        };
        fields.set(field, value);
    }
    Ok(StoredAgreement {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        fields,
    })
}

fn decode_stat(row: &PgRow) -> Result<DailyDonorStat, sqlx::Error> {
    Ok(DailyDonorStat {
        date: row.try_get("date")?,
        n_new_donors: row.try_get("n_new_donors")?,
        yearly_sum_new_donors: row.try_get("yearly_sum_new_donors")?,
        n_total_new_donors: row.try_get("n_total_new_donors")?,
        yearly_sum_all_donors: row.try_get("yearly_sum_all_donors")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>> {
        Ok(Box::new(PgSession {
            pool: self.pool.clone(),
            tx: None,
            savepoint_open: false,
        }))
    }

    async fn daily_stat(&self, date: NaiveDate) -> StoreResult<Option<DailyDonorStat>> {
        let row = sqlx::query(
            r#"
            SELECT date, n_new_donors, yearly_sum_new_donors, n_total_new_donors, yearly_sum_all_donors
              FROM daily_donor_stats
             WHERE date = $1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(decode_stat).transpose()?)
    }

    async fn upsert_daily_stat(&self, stat: &DailyDonorStat) -> StoreResult<DailyDonorStat> {
        let row = sqlx::query(
            r#"
            INSERT INTO daily_donor_stats
                (date, n_new_donors, yearly_sum_new_donors, n_total_new_donors, yearly_sum_all_donors)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (date) DO UPDATE
               SET n_new_donors = EXCLUDED.n_new_donors,
                   yearly_sum_new_donors = EXCLUDED.yearly_sum_new_donors,
                   n_total_new_donors = EXCLUDED.n_total_new_donors,
                   yearly_sum_all_donors = EXCLUDED.yearly_sum_all_donors
            RETURNING date, n_new_donors, yearly_sum_new_donors, n_total_new_donors, yearly_sum_all_donors
            "#,
        )
        .bind(stat.date)
        .bind(stat.n_new_donors)
        .bind(stat.yearly_sum_new_donors)
        .bind(stat.n_total_new_donors)
        .bind(stat.yearly_sum_all_donors)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(decode_stat(&row)?)
    }

    async fn new_donor_counts(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT n_new_donors
              FROM daily_donor_stats
             WHERE date BETWEEN $1 AND $2
             ORDER BY date
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("n_new_donors")?);
        }
        Ok(out)
    }

    async fn totals_by_county(&self) -> StoreResult<Vec<RegionTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(county, '') AS region,
                   COUNT(*)::BIGINT AS count,
                   COALESCE(SUM(amount), 0)::DOUBLE PRECISION AS sum
              FROM donor_agreements
             GROUP BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RegionTotal {
                region: row.try_get("region")?,
                count: row.try_get("count")?,
                sum: row.try_get("sum")?,
            });
        }
        Ok(out)
    }

    async fn totals_by_product(&self) -> StoreResult<Vec<ProductTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT product_type,
                   COUNT(*)::BIGINT AS count,
                   COALESCE(SUM(amount), 0)::DOUBLE PRECISION AS sum
              FROM donor_agreements
             GROUP BY product_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ProductTotal {
                product_type: row.try_get("product_type")?,
                count: row.try_get("count")?,
                sum: row.try_get("sum")?,
            });
        }
        Ok(out)
    }

    async fn agreements_starting_on(&self, date: NaiveDate) -> StoreResult<Vec<StoredAgreement>> {
        let rows = sqlx::query("SELECT * FROM donor_agreements WHERE start_date = $1 ORDER BY id")
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(decode_agreement(row)?);
        }
        Ok(out)
    }

    async fn clear_agreements(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM donor_agreements")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// One PostgreSQL transaction, opened on first use and reopened after each commit.
pub struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    savepoint_open: bool,
}

impl PgSession {
    async fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        let tx = match &mut self.tx {
            Some(tx) => tx,
            slot @ None => slot.insert(self.pool.begin().await?),
        };
        Ok(&mut **tx)
    }

    async fn execute_savepoint_command(&mut self, command: &str) -> StoreResult<()> {
        let sql = format!("{command} {ROW_SAVEPOINT}");
        sqlx::query(&sql).execute(self.conn().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn find_by_key(&mut self, key: &DedupKey) -> StoreResult<Option<StoredAgreement>> {
        let row = sqlx::query(
            r#"
            SELECT *
              FROM donor_agreements
             WHERE person_id = $1 AND agreement_id = $2
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(key.person_id)
        .bind(&key.agreement_id)
        .fetch_optional(self.conn().await?)
        .await?;
        Ok(row.as_ref().map(decode_agreement).transpose()?)
    }

    async fn insert(&mut self, fields: &RecordFragment) -> StoreResult<StoredAgreement> {
        let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO donor_agreements ");
        if fields.is_empty() {
            builder.push("DEFAULT VALUES");
        } else {
            builder.push("(");
            for (i, (field, _)) in fields.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push(field.column());
            }
            builder.push(") VALUES (");
            for (i, (field, value)) in fields.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                push_value(&mut builder, field, value);
            }
            builder.push(")");
        }
        builder.push(" RETURNING *");

        let row = builder
            .build()
            .fetch_one(self.conn().await?)
            .await
            .map_err(classify)?;
        Ok(decode_agreement(&row)?)
    }

    async fn update(&mut self, id: i64, fields: &RecordFragment) -> StoreResult<StoredAgreement> {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE donor_agreements SET ");
        for (field, value) in fields.iter() {
            builder.push(field.column());
            builder.push(" = ");
            push_value(&mut builder, field, value);
            builder.push(", ");
        }
        builder.push("updated_at = NOW() WHERE id = ");
        builder.push_bind(id);
        builder.push(" RETURNING *");

        let row = builder
            .build()
            .fetch_optional(self.conn().await?)
            .await
            .map_err(classify)?;
        match row {
            Some(row) => Ok(decode_agreement(&row)?),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn savepoint(&mut self) -> StoreResult<()> {
        self.execute_savepoint_command("SAVEPOINT").await?;
        self.savepoint_open = true;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> StoreResult<()> {
        if !self.savepoint_open {
            return Err(StoreError::NoSavepoint);
        }
        self.execute_savepoint_command("RELEASE SAVEPOINT").await?;
        self.savepoint_open = false;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()> {
        if !self.savepoint_open {
            return Err(StoreError::NoSavepoint);
        }
        self.execute_savepoint_command("ROLLBACK TO SAVEPOINT").await?;
        self.execute_savepoint_command("RELEASE SAVEPOINT").await?;
        self.savepoint_open = false;
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.savepoint_open = false;
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.savepoint_open = false;
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
