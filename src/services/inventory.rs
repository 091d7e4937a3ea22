use crate::{
    entities::{cart_item, order_item, product, product_variant},
    errors::ServiceError,
};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::collections::{BTreeSet, HashMap};
use tracing::instrument;
use uuid::Uuid;

/// One (product, optional variant, quantity) demand against inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRequirement {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
}

impl LineRequirement {
    pub fn from_cart_items(items: &[cart_item::Model]) -> Vec<Self> {
        items
            .iter()
            .map(|item| Self {
                product_id: item.product_id,
                variant_id: item.variant_id,
                quantity: item.quantity,
            })
            .collect()
    }

    pub fn from_order_items(items: &[order_item::Model]) -> Vec<Self> {
        items
            .iter()
            .map(|item| Self {
                product_id: item.product_id,
                variant_id: item.variant_id,
                quantity: item.quantity,
            })
            .collect()
    }
}

/// Inventory rows held under `FOR UPDATE` for the duration of the caller's
/// transaction.
#[derive(Debug)]
pub struct LockedStock {
    pub products: HashMap<Uuid, product::Model>,
    pub variants: HashMap<Uuid, product_variant::Model>,
}

impl LockedStock {
    /// Display name for a line, used in customer-facing stock errors.
    pub fn unit_name(&self, line: &LineRequirement) -> String {
        let product_name = self
            .products
            .get(&line.product_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| line.product_id.to_string());
        match line.variant_id.and_then(|id| self.variants.get(&id)) {
            Some(variant) => format!("{} - {}", product_name, variant.name),
            None => product_name,
        }
    }

    /// Current quantity of the sellable unit the line points at.
    pub fn available(&self, line: &LineRequirement) -> i32 {
        match line.variant_id {
            Some(variant_id) => self
                .variants
                .get(&variant_id)
                .map(|v| v.stock_quantity)
                .unwrap_or(0),
            None => self
                .products
                .get(&line.product_id)
                .map(|p| p.stock_quantity)
                .unwrap_or(0),
        }
    }

    fn product(&self, line: &LineRequirement) -> Option<&product::Model> {
        self.products.get(&line.product_id)
    }
}

/// The only mutator of `stock_quantity`. Every multi-row caller (checkout,
/// cancel, refund, payment failure) goes through [`InventoryService::lock_lines`],
/// which acquires row locks in ascending-id order, the total ordering that
/// makes concurrent checkouts deadlock-free.
pub struct InventoryService;

impl InventoryService {
    /// Locks every inventory row the lines reference, products first then
    /// variants, each set sorted ascending by id. Must be called inside an
    /// open transaction; the locks are held until it commits or rolls back.
    #[instrument(skip(conn, lines), fields(line_count = lines.len()))]
    pub async fn lock_lines<C: ConnectionTrait>(
        conn: &C,
        lines: &[LineRequirement],
    ) -> Result<LockedStock, ServiceError> {
        let product_ids: BTreeSet<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let variant_ids: BTreeSet<Uuid> = lines.iter().filter_map(|l| l.variant_id).collect();

        let products: HashMap<Uuid, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids.iter().copied()))
            .order_by_asc(product::Column::Id)
            .lock_exclusive()
            .all(conn)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        for id in &product_ids {
            if !products.contains_key(id) {
                return Err(ServiceError::NotFound(format!("Product {} not found", id)));
            }
        }

        let mut variants: HashMap<Uuid, product_variant::Model> = HashMap::new();
        if !variant_ids.is_empty() {
            variants = product_variant::Entity::find()
                .filter(product_variant::Column::Id.is_in(variant_ids.iter().copied()))
                .order_by_asc(product_variant::Column::Id)
                .lock_exclusive()
                .all(conn)
                .await?
                .into_iter()
                .map(|v| (v.id, v))
                .collect();

            for id in &variant_ids {
                if !variants.contains_key(id) {
                    return Err(ServiceError::NotFound(format!("Variant {} not found", id)));
                }
            }
        }

        Ok(LockedStock { products, variants })
    }

    /// Validates every line against the locked quantities. No partial
    /// result: the first failing line aborts the whole reservation.
    pub fn check_availability(
        locked: &LockedStock,
        lines: &[LineRequirement],
    ) -> Result<(), ServiceError> {
        for line in lines {
            let product = locked
                .product(line)
                .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", line.product_id)))?;

            if !product.track_inventory || product.allow_backorder {
                continue;
            }

            let available = locked.available(line);
            if available < line.quantity {
                return Err(ServiceError::insufficient_stock(
                    locked.unit_name(line),
                    line.quantity,
                    available,
                ));
            }
        }
        Ok(())
    }

    /// Decrements each tracked line's inventory row. Must run after
    /// [`Self::lock_lines`] + [`Self::check_availability`] in the same
    /// transaction. A CHECK-constraint violation here means another writer
    /// slipped past the pre-check; it is reported as the same sold-out
    /// error, and the enclosing transaction rolls back with no partial
    /// decrement. Backordered lines are clamped at zero rather than driven
    /// negative.
    pub async fn reserve<C: ConnectionTrait>(
        conn: &C,
        locked: &LockedStock,
        lines: &[LineRequirement],
    ) -> Result<(), ServiceError> {
        for line in lines {
            let product = locked
                .product(line)
                .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", line.product_id)))?;

            if !product.track_inventory {
                continue;
            }

            let name = locked.unit_name(line);
            let clamp = product.allow_backorder;

            let rows_affected = match line.variant_id {
                Some(variant_id) => {
                    let expr = decrement_expr(
                        Expr::col(product_variant::Column::StockQuantity),
                        line.quantity,
                        clamp,
                    );
                    product_variant::Entity::update_many()
                        .col_expr(product_variant::Column::StockQuantity, expr)
                        .filter(product_variant::Column::Id.eq(variant_id))
                        .exec(conn)
                        .await
                        .map_err(|e| ServiceError::from_stock_write_error(e, &name, line.quantity))?
                        .rows_affected
                }
                None => {
                    let expr = decrement_expr(
                        Expr::col(product::Column::StockQuantity),
                        line.quantity,
                        clamp,
                    );
                    product::Entity::update_many()
                        .col_expr(product::Column::StockQuantity, expr)
                        .filter(product::Column::Id.eq(line.product_id))
                        .exec(conn)
                        .await
                        .map_err(|e| ServiceError::from_stock_write_error(e, &name, line.quantity))?
                        .rows_affected
                }
            };

            if rows_affected == 0 {
                return Err(ServiceError::insufficient_stock(name, line.quantity, 0));
            }
        }
        Ok(())
    }

    /// Inverse of [`Self::reserve`]: increments each tracked line. The
    /// caller guards against running it twice for the same event by
    /// checking order status inside the same lock scope.
    pub async fn restore<C: ConnectionTrait>(
        conn: &C,
        locked: &LockedStock,
        lines: &[LineRequirement],
    ) -> Result<(), ServiceError> {
        for line in lines {
            let product = locked
                .product(line)
                .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", line.product_id)))?;

            if !product.track_inventory {
                continue;
            }

            match line.variant_id {
                Some(variant_id) => {
                    product_variant::Entity::update_many()
                        .col_expr(
                            product_variant::Column::StockQuantity,
                            Expr::col(product_variant::Column::StockQuantity).add(line.quantity),
                        )
                        .filter(product_variant::Column::Id.eq(variant_id))
                        .exec(conn)
                        .await?;
                }
                None => {
                    product::Entity::update_many()
                        .col_expr(
                            product::Column::StockQuantity,
                            Expr::col(product::Column::StockQuantity).add(line.quantity),
                        )
                        .filter(product::Column::Id.eq(line.product_id))
                        .exec(conn)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// `stock = stock - qty`, or a zero-clamped variant for backorderable
/// rows so the non-negative CHECK never fires on an allowed oversell.
fn decrement_expr(
    column: Expr,
    quantity: i32,
    clamp_at_zero: bool,
) -> sea_orm::sea_query::SimpleExpr {
    if clamp_at_zero {
        Expr::case(
            column.clone().gte(quantity),
            column.clone().sub(quantity),
        )
        .finally(0)
        .into()
    } else {
        column.sub(quantity)
    }
}
