#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;
    use diesel::prelude::*;
    use diesel::Connection;
    use diesel::PgConnection;
    use diesel_migrations::MigrationHarness;
    use diesel_async::pooled_connection::bb8::Pool;
    use diesel_async::pooled_connection::AsyncDieselConnectionManager;
    use diesel_async::{AsyncPgConnection, RunQueryDsl};
    use std::str::FromStr;
    use uuid::Uuid;

    use crate::models::{NewOrder, NewUser, OrderStatus, PaymentMethod};
    use crate::orders::{OrderEngine, OrderError, OrderItemRequest, ShippingInfo};
    use crate::schema::{order_details, orders, product_variants, products, users};

    type DbPool = Pool<AsyncPgConnection>;

    fn database_url() -> String {
        std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL must point at a PostgreSQL database")
    }

    async fn test_pool() -> DbPool {
        let url = database_url();
        let mut conn = PgConnection::establish(&url).expect("connect for migrations");
        conn.run_pending_migrations(crate::MIGRATIONS)
            .expect("run migrations");

        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
        Pool::builder().build(config).await.expect("build pool")
    }

    async fn seed_user(conn: &mut AsyncPgConnection) -> Uuid {
        let user = NewUser {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", Uuid::new_v4()),
            password_hash: "x".to_string(),
            name: "Test Shopper".to_string(),
            phone: None,
            role: "customer".to_string(),
        };
        diesel::insert_into(users::table)
            .values(&user)
            .execute(conn)
            .await
            .expect("seed user");
        user.id
    }

    async fn seed_product(conn: &mut AsyncPgConnection, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        diesel::insert_into(products::table)
            .values((
                products::id.eq(id),
                products::name.eq(name),
                products::slug.eq(format!("{}-{}", name.to_lowercase().replace(' ', "-"), id)),
                products::base_price.eq(BigDecimal::from_str("10.00").unwrap()),
                products::sold_count.eq(0),
                products::is_active.eq(true),
            ))
            .execute(conn)
            .await
            .expect("seed product");
        id
    }

    async fn seed_variant(
        conn: &mut AsyncPgConnection,
        product_id: Uuid,
        price: &str,
        stock: i32,
    ) -> Uuid {
        let id = Uuid::new_v4();
        diesel::insert_into(product_variants::table)
            .values((
                product_variants::id.eq(id),
                product_variants::product_id.eq(product_id),
                product_variants::color.eq("black"),
                product_variants::size.eq("M"),
                product_variants::price.eq(BigDecimal::from_str(price).unwrap()),
                product_variants::stock.eq(stock),
            ))
            .execute(conn)
            .await
            .expect("seed variant");
        id
    }

    async fn stock_of(conn: &mut AsyncPgConnection, variant_id: Uuid) -> i32 {
        product_variants::table
            .find(variant_id)
            .select(product_variants::stock)
            .first::<i32>(conn)
            .await
            .expect("read stock")
    }

    fn shipping() -> ShippingInfo {
        ShippingInfo {
            name: "Test Shopper".to_string(),
            phone: "555-0100".to_string(),
            address: "1 Test Lane".to_string(),
            note: None,
        }
    }

    fn line(sku_id: Uuid, quantity: i32) -> OrderItemRequest {
        OrderItemRequest { sku_id, quantity }
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set TEST_DATABASE_URL)"]
    async fn placing_and_cancelling_an_order_round_trips_stock() {
        let pool = test_pool().await;
        let mut conn = pool.get().await.unwrap();
        let user_id = seed_user(&mut conn).await;
        let product_id = seed_product(&mut conn, "Canvas Tote").await;
        let variant_id = seed_variant(&mut conn, product_id, "19.99", 5).await;
        drop(conn);

        let engine = OrderEngine::new(pool.clone());

        // Ordering exactly the remaining stock succeeds and empties it.
        let placed = engine
            .create_order(user_id, vec![line(variant_id, 5)], shipping(), PaymentMethod::Cod)
            .await
            .expect("order A");
        assert_eq!(placed.item_count, 1);
        assert_eq!(placed.total_amount, BigDecimal::from_str("99.95").unwrap());

        let mut conn = pool.get().await.unwrap();
        assert_eq!(stock_of(&mut conn, variant_id).await, 0);

        let (status, total) = orders::table
            .find(placed.order_id)
            .select((orders::status, orders::total_amount))
            .first::<(String, BigDecimal)>(&mut conn)
            .await
            .unwrap();
        assert_eq!(status, OrderStatus::New.as_str());
        assert_eq!(total, BigDecimal::from_str("99.95").unwrap());

        let detail_count = order_details::table
            .filter(order_details::order_id.eq(placed.order_id))
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .unwrap();
        assert_eq!(detail_count, 1);
        drop(conn);

        // A second order against the emptied SKU is rejected, naming the
        // remaining availability.
        let err = engine
            .create_order(user_id, vec![line(variant_id, 1)], shipping(), PaymentMethod::Cod)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only 0 available"), "{err}");

        // Cancel restores the stock and flips the status.
        engine.cancel_order(user_id, placed.order_id).await.expect("cancel");
        let mut conn = pool.get().await.unwrap();
        assert_eq!(stock_of(&mut conn, variant_id).await, 5);
        let status = orders::table
            .find(placed.order_id)
            .select(orders::status)
            .first::<String>(&mut conn)
            .await
            .unwrap();
        assert_eq!(status, OrderStatus::Cancelled.as_str());
        drop(conn);

        // Cancelling again is rejected with no further restock.
        let err = engine.cancel_order(user_id, placed.order_id).await.unwrap_err();
        assert!(matches!(err, OrderError::NotCancellable(_)));
        let mut conn = pool.get().await.unwrap();
        assert_eq!(stock_of(&mut conn, variant_id).await, 5);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set TEST_DATABASE_URL)"]
    async fn failed_multi_line_order_leaves_no_residue() {
        let pool = test_pool().await;
        let mut conn = pool.get().await.unwrap();
        let user_id = seed_user(&mut conn).await;
        let product_id = seed_product(&mut conn, "Linen Shirt").await;
        let roomy = seed_variant(&mut conn, product_id, "25.00", 3).await;
        let scarce = seed_variant(&mut conn, product_id, "25.00", 1).await;
        drop(conn);

        let engine = OrderEngine::new(pool.clone());

        // The first line fits, the second does not; nothing may persist.
        let err = engine
            .create_order(
                user_id,
                vec![line(roomy, 2), line(scarce, 2)],
                shipping(),
                PaymentMethod::Card,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InsufficientStock { .. }));

        let mut conn = pool.get().await.unwrap();
        assert_eq!(stock_of(&mut conn, roomy).await, 3);
        assert_eq!(stock_of(&mut conn, scarce).await, 1);
        let order_count = orders::table
            .filter(orders::user_id.eq(user_id))
            .count()
            .get_result::<i64>(&mut conn)
            .await
            .unwrap();
        assert_eq!(order_count, 0);
        drop(conn);

        // A line referencing a nonexistent SKU aborts the batch the same way.
        let ghost = Uuid::new_v4();
        let err = engine
            .create_order(
                user_id,
                vec![line(roomy, 1), line(ghost, 1)],
                shipping(),
                PaymentMethod::Cod,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::VariantNotFound(id) if id == ghost));

        let mut conn = pool.get().await.unwrap();
        assert_eq!(stock_of(&mut conn, roomy).await, 3);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set TEST_DATABASE_URL)"]
    async fn cancel_is_scoped_to_the_owner_and_to_cancellable_statuses() {
        let pool = test_pool().await;
        let mut conn = pool.get().await.unwrap();
        let owner = seed_user(&mut conn).await;
        let stranger = seed_user(&mut conn).await;
        let product_id = seed_product(&mut conn, "Wool Beanie").await;
        let variant_id = seed_variant(&mut conn, product_id, "12.00", 10).await;
        drop(conn);

        let engine = OrderEngine::new(pool.clone());
        let placed = engine
            .create_order(owner, vec![line(variant_id, 2)], shipping(), PaymentMethod::Cod)
            .await
            .unwrap();

        // Someone else's order reads as not found.
        let err = engine.cancel_order(stranger, placed.order_id).await.unwrap_err();
        assert!(matches!(err, OrderError::OrderNotFound));

        // A completed order can no longer be cancelled.
        let mut conn = pool.get().await.unwrap();
        diesel::update(orders::table.find(placed.order_id))
            .set(orders::status.eq(OrderStatus::Completed.as_str()))
            .execute(&mut conn)
            .await
            .unwrap();
        drop(conn);

        let err = engine.cancel_order(owner, placed.order_id).await.unwrap_err();
        assert!(matches!(err, OrderError::NotCancellable(_)));
        let mut conn = pool.get().await.unwrap();
        assert_eq!(stock_of(&mut conn, variant_id).await, 8);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set TEST_DATABASE_URL)"]
    async fn processing_orders_are_still_cancellable() {
        let pool = test_pool().await;
        let mut conn = pool.get().await.unwrap();
        let user_id = seed_user(&mut conn).await;
        let product_id = seed_product(&mut conn, "Denim Jacket").await;
        let variant_id = seed_variant(&mut conn, product_id, "49.00", 4).await;
        drop(conn);

        let engine = OrderEngine::new(pool.clone());
        let placed = engine
            .create_order(user_id, vec![line(variant_id, 4)], shipping(), PaymentMethod::Cod)
            .await
            .unwrap();

        let mut conn = pool.get().await.unwrap();
        diesel::update(orders::table.find(placed.order_id))
            .set(orders::status.eq(OrderStatus::Processing.as_str()))
            .execute(&mut conn)
            .await
            .unwrap();
        drop(conn);

        engine.cancel_order(user_id, placed.order_id).await.expect("cancel processing");
        let mut conn = pool.get().await.unwrap();
        assert_eq!(stock_of(&mut conn, variant_id).await, 4);
    }

    // NewOrder is exercised through the engine; this keeps the direct
    // Insertable path honest for administrative tooling that seeds orders.
    #[tokio::test]
    #[ignore = "requires PostgreSQL (set TEST_DATABASE_URL)"]
    async fn seeded_orders_respect_the_status_vocabulary() {
        let pool = test_pool().await;
        let mut conn = pool.get().await.unwrap();
        let user_id = seed_user(&mut conn).await;

        let seeded = NewOrder {
            id: Uuid::new_v4(),
            user_id,
            total_amount: BigDecimal::from_str("0").unwrap(),
            status: OrderStatus::Shipping.as_str().to_string(),
            payment_method: PaymentMethod::Card.as_str().to_string(),
            is_paid: true,
            shipping_name: "Test Shopper".to_string(),
            shipping_phone: "555-0100".to_string(),
            shipping_address: "1 Test Lane".to_string(),
            note: None,
        };
        diesel::insert_into(orders::table)
            .values(&seeded)
            .execute(&mut conn)
            .await
            .unwrap();

        let status = orders::table
            .find(seeded.id)
            .select(orders::status)
            .first::<String>(&mut conn)
            .await
            .unwrap();
        assert_eq!(OrderStatus::parse(&status), Some(OrderStatus::Shipping));
    }
}
