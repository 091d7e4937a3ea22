use crate::{
    entities::{coupon, coupon_usage, Coupon, CouponUsage},
    errors::{CouponRejection, ServiceError},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QuerySelect, Set,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// How long the in-memory active-coupon snapshot may be served before it
/// is rebuilt. Staleness here is a bounded, accepted risk for listing
/// endpoints only; checkout-path validation always reads the database.
const SNAPSHOT_TTL: Duration = Duration::from_secs(60);

/// Lightweight view of an active coupon for listing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCouponSummary {
    pub code: String,
    pub name: String,
    pub min_order_amount: Decimal,
}

/// Coupon validation, discount calculation, and redemption counting.
///
/// Redemption uses an atomic, guarded `times_used = times_used + 1`
/// update (never read-modify-write), so the global limit holds under
/// concurrent redemptions: at the last allowed use, the first committing
/// transaction wins and every concurrent loser aborts with a usage-limit
/// rejection.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
    snapshot: Arc<DashMap<(), (Instant, Vec<ActiveCouponSummary>)>>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            snapshot: Arc::new(DashMap::new()),
        }
    }

    /// Flag/window/global-limit validity. Pure; per-user limits need the
    /// database and live in [`Self::check_user_limit`].
    pub fn check_window(coupon: &coupon::Model, now: DateTime<Utc>) -> Result<(), CouponRejection> {
        if !coupon.is_active {
            return Err(CouponRejection::Inactive);
        }
        if coupon.starts_at > now {
            return Err(CouponRejection::NotStarted);
        }
        if let Some(expires_at) = coupon.expires_at {
            if expires_at < now {
                return Err(CouponRejection::Expired);
            }
        }
        if let Some(limit) = coupon.usage_limit {
            if coupon.times_used >= limit {
                return Err(CouponRejection::UsageLimitReached);
            }
        }
        Ok(())
    }

    /// Discount for `subtotal` per the coupon's type. Percentage coupons
    /// are clamped to `max_discount`; fixed coupons never exceed the
    /// subtotal; free-shipping coupons return zero and signal the waiver
    /// through [`Self::provides_free_shipping`].
    pub fn calculate_discount(coupon: &coupon::Model, subtotal: Decimal) -> Decimal {
        match coupon.discount_type {
            coupon::DiscountType::Percentage => {
                let discount = subtotal * (coupon.discount_value / Decimal::from(100));
                match coupon.max_discount {
                    Some(cap) if discount > cap => cap,
                    _ => discount,
                }
            }
            coupon::DiscountType::Fixed => coupon.discount_value.min(subtotal),
            coupon::DiscountType::FreeShipping => Decimal::ZERO,
        }
    }

    pub fn provides_free_shipping(coupon: &coupon::Model) -> bool {
        matches!(coupon.discount_type, coupon::DiscountType::FreeShipping)
    }

    /// Per-user limit check: counts `coupon_usage` rows, the authority for
    /// this limit, rather than any cached counter.
    pub async fn check_user_limit<C: ConnectionTrait>(
        conn: &C,
        coupon: &coupon::Model,
        customer_id: Uuid,
    ) -> Result<(), ServiceError> {
        let Some(per_user_limit) = coupon.usage_limit_per_user else {
            return Ok(());
        };

        let used = CouponUsage::find()
            .filter(coupon_usage::Column::CouponId.eq(coupon.id))
            .filter(coupon_usage::Column::CustomerId.eq(customer_id))
            .count(conn)
            .await?;

        if used >= per_user_limit as u64 {
            return Err(ServiceError::coupon(CouponRejection::UserLimitReached));
        }
        Ok(())
    }

    /// Authoritative checkout-time validation. Locks the coupon row for
    /// the rest of the transaction, so two same-user checkouts racing the
    /// same code serialize here: the second re-reads the first's usage row
    /// and fails the per-user check.
    #[instrument(skip(conn))]
    pub async fn validate_for_checkout<C: ConnectionTrait>(
        conn: &C,
        coupon_id: Uuid,
        customer_id: Uuid,
        subtotal: Decimal,
    ) -> Result<coupon::Model, ServiceError> {
        let coupon = Coupon::find()
            .filter(coupon::Column::Id.eq(coupon_id))
            .lock_exclusive()
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::coupon(CouponRejection::NotFound))?;

        Self::check_window(&coupon, Utc::now()).map_err(ServiceError::coupon)?;

        if subtotal < coupon.min_order_amount {
            return Err(ServiceError::coupon(CouponRejection::MinimumNotMet));
        }

        Self::check_user_limit(conn, &coupon, customer_id).await?;

        Ok(coupon)
    }

    /// Records one redemption: the guarded atomic increment plus the
    /// `coupon_usage` audit row. Zero affected rows means another
    /// transaction consumed the last allowed use first.
    #[instrument(skip(conn))]
    pub async fn redeem<C: ConnectionTrait>(
        conn: &C,
        coupon_id: Uuid,
        customer_id: Uuid,
        order_id: Uuid,
        discount_amount: Decimal,
    ) -> Result<(), ServiceError> {
        let result = Coupon::update_many()
            .col_expr(
                coupon::Column::TimesUsed,
                Expr::col(coupon::Column::TimesUsed).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Id.eq(coupon_id))
            .filter(
                Condition::any()
                    .add(coupon::Column::UsageLimit.is_null())
                    .add(
                        Expr::col(coupon::Column::TimesUsed)
                            .lt(Expr::col(coupon::Column::UsageLimit)),
                    ),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(coupon_id = %coupon_id, "Redemption lost the race for the last allowed use");
            return Err(ServiceError::coupon(CouponRejection::UsageLimitReached));
        }

        coupon_usage::ActiveModel {
            id: Set(Uuid::new_v4()),
            coupon_id: Set(coupon_id),
            customer_id: Set(customer_id),
            order_id: Set(order_id),
            discount_amount: Set(discount_amount),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;

        Ok(())
    }

    /// Time-boxed snapshot of active coupon codes for listing endpoints.
    /// May serve a just-deactivated coupon for up to the TTL.
    pub async fn active_codes(&self) -> Result<Vec<ActiveCouponSummary>, ServiceError> {
        if let Some(entry) = self.snapshot.get(&()) {
            let (built_at, cached) = entry.value();
            if built_at.elapsed() < SNAPSHOT_TTL {
                return Ok(cached.clone());
            }
        }

        let now = Utc::now();
        let coupons = Coupon::find()
            .filter(coupon::Column::IsActive.eq(true))
            .filter(coupon::Column::StartsAt.lte(now))
            .filter(
                Condition::any()
                    .add(coupon::Column::ExpiresAt.is_null())
                    .add(coupon::Column::ExpiresAt.gt(now)),
            )
            .all(&*self.db)
            .await?;

        let summaries: Vec<ActiveCouponSummary> = coupons
            .into_iter()
            .filter(|c| match c.usage_limit {
                Some(limit) => c.times_used < limit,
                None => true,
            })
            .map(|c| ActiveCouponSummary {
                code: c.code,
                name: c.name,
                min_order_amount: c.min_order_amount,
            })
            .collect();

        self.snapshot.insert((), (Instant::now(), summaries.clone()));
        info!(count = summaries.len(), "Rebuilt active-coupon snapshot");
        Ok(summaries)
    }

    /// Drops the snapshot so the next read rebuilds it.
    pub fn invalidate_snapshot(&self) {
        self.snapshot.remove(&());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_coupon(discount_type: coupon::DiscountType, value: Decimal) -> coupon::Model {
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SAVE10".into(),
            name: "Ten percent off".into(),
            discount_type,
            discount_value: value,
            max_discount: None,
            min_order_amount: Decimal::ZERO,
            usage_limit: None,
            usage_limit_per_user: Some(1),
            times_used: 0,
            starts_at: Utc::now() - chrono::Duration::days(1),
            expires_at: Some(Utc::now() + chrono::Duration::days(30)),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn percentage_discount_scales_with_subtotal() {
        let coupon = base_coupon(coupon::DiscountType::Percentage, dec!(10));
        let discount = CouponService::calculate_discount(&coupon, dec!(200000));
        assert_eq!(discount, dec!(20000));
    }

    #[test]
    fn percentage_discount_respects_cap() {
        let mut coupon = base_coupon(coupon::DiscountType::Percentage, dec!(50));
        coupon.max_discount = Some(dec!(30000));
        let discount = CouponService::calculate_discount(&coupon, dec!(200000));
        assert_eq!(discount, dec!(30000));
    }

    #[test]
    fn fixed_discount_never_exceeds_subtotal() {
        let coupon = base_coupon(coupon::DiscountType::Fixed, dec!(500000));
        let discount = CouponService::calculate_discount(&coupon, dec!(120000));
        assert_eq!(discount, dec!(120000));
    }

    #[test]
    fn free_shipping_gives_zero_subtotal_discount() {
        let coupon = base_coupon(coupon::DiscountType::FreeShipping, Decimal::ZERO);
        assert_eq!(
            CouponService::calculate_discount(&coupon, dec!(500000)),
            Decimal::ZERO
        );
        assert!(CouponService::provides_free_shipping(&coupon));
    }

    #[test]
    fn window_check_rejects_inactive() {
        let mut coupon = base_coupon(coupon::DiscountType::Percentage, dec!(10));
        coupon.is_active = false;
        assert_eq!(
            CouponService::check_window(&coupon, Utc::now()),
            Err(CouponRejection::Inactive)
        );
    }

    #[test]
    fn window_check_rejects_not_started_and_expired() {
        let mut coupon = base_coupon(coupon::DiscountType::Percentage, dec!(10));
        coupon.starts_at = Utc::now() + chrono::Duration::days(1);
        assert_eq!(
            CouponService::check_window(&coupon, Utc::now()),
            Err(CouponRejection::NotStarted)
        );

        let mut coupon = base_coupon(coupon::DiscountType::Percentage, dec!(10));
        coupon.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(
            CouponService::check_window(&coupon, Utc::now()),
            Err(CouponRejection::Expired)
        );
    }

    #[test]
    fn window_check_rejects_exhausted_global_limit() {
        let mut coupon = base_coupon(coupon::DiscountType::Percentage, dec!(10));
        coupon.usage_limit = Some(100);
        coupon.times_used = 100;
        assert_eq!(
            CouponService::check_window(&coupon, Utc::now()),
            Err(CouponRejection::UsageLimitReached)
        );
    }

    #[test]
    fn window_check_accepts_unlimited_coupons() {
        let mut coupon = base_coupon(coupon::DiscountType::Percentage, dec!(10));
        coupon.usage_limit = None;
        coupon.times_used = 1_000_000;
        assert!(CouponService::check_window(&coupon, Utc::now()).is_ok());
    }
}
