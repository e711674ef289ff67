//! Move-history queries over the append-only ledger.

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Select,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::entities::audit_ledger::{self, Entity as AuditLedger, TransactionType};
use crate::errors::ServiceError;

pub const MAX_PAGE_SIZE: u64 = 1000;
pub const DEFAULT_PAGE_SIZE: u64 = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerFilter {
    pub product_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    pub transaction_type: Option<TransactionType>,
    pub document_id: Option<Uuid>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub to: Option<DateTime<Utc>>,
}

impl LedgerFilter {
    fn apply(&self, mut query: Select<AuditLedger>) -> Select<AuditLedger> {
        if let Some(product_id) = self.product_id {
            query = query.filter(audit_ledger::Column::ProductId.eq(product_id));
        }
        if let Some(warehouse_id) = self.warehouse_id {
            query = query.filter(audit_ledger::Column::WarehouseId.eq(warehouse_id));
        }
        if let Some(transaction_type) = self.transaction_type {
            query = query.filter(audit_ledger::Column::TransactionType.eq(transaction_type));
        }
        if let Some(document_id) = self.document_id {
            query = query.filter(audit_ledger::Column::DocumentId.eq(document_id));
        }
        if let Some(from) = self.from {
            query = query.filter(audit_ledger::Column::Timestamp.gte(from));
        }
        if let Some(to) = self.to {
            query = query.filter(audit_ledger::Column::Timestamp.lt(to));
        }
        query
    }
}

#[derive(Clone)]
pub struct AuditLedgerService {
    db_pool: Arc<DatabaseConnection>,
    default_page_size: u64,
}

impl AuditLedgerService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self {
            db_pool,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Page size used when [`list`](Self::list) is called without a limit.
    pub fn with_default_page_size(mut self, default_page_size: u64) -> Self {
        self.default_page_size = default_page_size;
        self
    }

    /// Lists ledger rows newest first, returning the page and the total match count.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        filter: LedgerFilter,
        page: u64,
        limit: Option<u64>,
    ) -> Result<(Vec<audit_ledger::Model>, u64), ServiceError> {
        let limit = limit.unwrap_or(self.default_page_size);
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(ServiceError::ValidationError(format!(
                "Limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(ServiceError::ValidationError(
                    "Date range start must not be after its end".to_string(),
                ));
            }
        }

        let query = filter
            .apply(AuditLedger::find())
            .order_by_desc(audit_ledger::Column::Timestamp)
            .order_by_desc(audit_ledger::Column::Id);

        let paginator = query.paginate(&*self.db_pool, limit);
        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page - 1).await?;

        Ok((rows, total))
    }

    /// Every row written by one document, oldest first. Rows sharing a
    /// timestamp are ordered by id so repeated reads agree.
    pub async fn for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<audit_ledger::Model>, ServiceError> {
        Ok(AuditLedger::find()
            .filter(audit_ledger::Column::DocumentId.eq(document_id))
            .order_by_asc(audit_ledger::Column::Timestamp)
            .order_by_asc(audit_ledger::Column::Id)
            .all(&*self.db_pool)
            .await?)
    }
}
