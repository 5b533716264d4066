diesel::table! {
    users (id) {
        id -> Int4,
        username -> Text,
        email -> Text,
        password -> Text,
        bio -> Nullable<Text>,
        image -> Nullable<Text>,
    }
}

diesel::table! {
    articles (id) {
        id -> Int4,
        author_id -> Int4,
        slug -> Text,
        title -> Text,
        description -> Text,
        body -> Text,
        tag_list -> Array<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    comments (id) {
        id -> Int4,
        article_id -> Int4,
        user_id -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        body -> Text,
    }
}

diesel::table! {
    favorites (id) {
        id -> Int4,
        article_id -> Int4,
        user_id -> Int4,
    }
}

diesel::table! {
    follows (id) {
        id -> Int4,
        follower_id -> Int4,
        followed_id -> Int4,
    }
}

diesel::joinable!(articles -> users (author_id));
diesel::joinable!(comments -> articles (article_id));
diesel::joinable!(comments -> users (user_id));
diesel::joinable!(favorites -> articles (article_id));

diesel::allow_tables_to_appear_in_same_query!(users, articles, comments, favorites, follows);
