diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Varchar,
        password_hash -> Varchar,
        name -> Varchar,
        phone -> Nullable<Varchar>,
        role -> Varchar,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    categories (id) {
        id -> Uuid,
        name -> Varchar,
        slug -> Varchar,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    products (id) {
        id -> Uuid,
        category_id -> Nullable<Uuid>,
        name -> Varchar,
        slug -> Varchar,
        description -> Nullable<Varchar>,
        base_price -> Numeric,
        sold_count -> Int4,
        is_active -> Bool,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    product_variants (id) {
        id -> Uuid,
        product_id -> Uuid,
        color -> Varchar,
        size -> Varchar,
        price -> Numeric,
        stock -> Int4,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    cart_items (id) {
        id -> Uuid,
        user_id -> Uuid,
        variant_id -> Uuid,
        quantity -> Int4,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        user_id -> Uuid,
        total_amount -> Numeric,
        status -> Varchar,
        payment_method -> Varchar,
        is_paid -> Bool,
        shipping_name -> Varchar,
        shipping_phone -> Varchar,
        shipping_address -> Varchar,
        note -> Nullable<Varchar>,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    order_details (id) {
        id -> Uuid,
        order_id -> Uuid,
        variant_id -> Uuid,
        product_name -> Varchar,
        color -> Varchar,
        size -> Varchar,
        unit_price -> Numeric,
        quantity -> Int4,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    addresses (id) {
        id -> Uuid,
        user_id -> Uuid,
        recipient -> Varchar,
        phone -> Varchar,
        address -> Varchar,
        is_default -> Bool,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    wishlist_items (id) {
        id -> Uuid,
        user_id -> Uuid,
        product_id -> Uuid,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    reviews (id) {
        id -> Uuid,
        user_id -> Uuid,
        product_id -> Uuid,
        order_id -> Uuid,
        rating -> Int4,
        comment -> Nullable<Varchar>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(products -> categories (category_id));
diesel::joinable!(product_variants -> products (product_id));
diesel::joinable!(cart_items -> users (user_id));
diesel::joinable!(cart_items -> product_variants (variant_id));
diesel::joinable!(orders -> users (user_id));
diesel::joinable!(order_details -> orders (order_id));
diesel::joinable!(order_details -> product_variants (variant_id));
diesel::joinable!(addresses -> users (user_id));
diesel::joinable!(wishlist_items -> users (user_id));
diesel::joinable!(wishlist_items -> products (product_id));
diesel::joinable!(reviews -> users (user_id));
diesel::joinable!(reviews -> products (product_id));
diesel::joinable!(reviews -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    categories,
    products,
    product_variants,
    cart_items,
    orders,
    order_details,
    addresses,
    wishlist_items,
    reviews,
);
