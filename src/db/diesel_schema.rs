// Diesel table definitions; DDL lives in schema.rs.

diesel::table! {
    users (id) {
        id -> Text,
        username -> Text,
        used_storage -> BigInt,
        quota -> BigInt,
        created_at -> Text,
    }
}

diesel::table! {
    files (id) {
        id -> Text,
        hash -> Text,
        object_key -> Text,
        size -> BigInt,
        mime_type -> Text,
        ref_count -> BigInt,
        created_at -> Text,
    }
}

diesel::table! {
    user_files (id) {
        id -> Text,
        user_id -> Text,
        file_id -> Text,
        is_owner -> Bool,
        visibility -> Text,
        downloads -> BigInt,
        created_at -> Text,
    }
}

diesel::table! {
    pending_deletes (hash) {
        hash -> Text,
        object_key -> Text,
        created_at -> Text,
    }
}

diesel::joinable!(user_files -> files (file_id));
diesel::joinable!(user_files -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(files, pending_deletes, user_files, users);
