//! Forward-only schema migrations.
//!
//! Each entry is one migration applied inside its own transaction; the
//! applied version is tracked in `schema_migrations`. A database whose
//! recorded version exceeds [`MIGRATIONS`] was written by a newer build and
//! the store refuses to open it.
//!
//! Timestamp convention: `*_at` columns hold Unix seconds, `*_at_ms`
//! columns hold Unix milliseconds.

pub(crate) const MIGRATIONS: &[&str] = &[
    // v1: full initial schema.
    r#"
    CREATE TABLE conversations (
        id                   TEXT PRIMARY KEY,
        title                TEXT NOT NULL DEFAULT '',
        source               TEXT NOT NULL DEFAULT 'openai',
        folder               TEXT NOT NULL DEFAULT '',
        created_at           INTEGER NOT NULL DEFAULT 0,
        updated_at           INTEGER NOT NULL DEFAULT 0,
        message_count        INTEGER NOT NULL DEFAULT 0,
        is_interesting       INTEGER NOT NULL DEFAULT 0,
        summary              TEXT,
        summary_embedding_id TEXT,
        metadata             TEXT NOT NULL DEFAULT '{}'
    );

    CREATE TABLE messages (
        id              TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        role            TEXT NOT NULL DEFAULT 'user',
        content         TEXT NOT NULL DEFAULT '',
        parent_id       TEXT,
        created_at      INTEGER NOT NULL DEFAULT 0,
        embedding_id    TEXT
    );
    CREATE INDEX idx_messages_conversation ON messages(conversation_id);

    CREATE TABLE content_items (
        id             TEXT PRIMARY KEY,
        item_type      TEXT NOT NULL DEFAULT 'post',
        source         TEXT NOT NULL DEFAULT '',
        text           TEXT,
        title          TEXT,
        created_at     INTEGER NOT NULL DEFAULT 0,
        author_name    TEXT,
        is_own_content INTEGER NOT NULL DEFAULT 0,
        thread_id      TEXT,
        parent_id      TEXT,
        media_refs     TEXT NOT NULL DEFAULT '[]',
        metadata       TEXT NOT NULL DEFAULT '{}',
        uri            TEXT UNIQUE,
        embedding_id   TEXT
    );
    CREATE INDEX idx_content_items_source ON content_items(source);
    CREATE INDEX idx_content_items_type ON content_items(item_type);

    CREATE TABLE content_blocks (
        id                     TEXT PRIMARY KEY,
        parent_message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        parent_conversation_id TEXT NOT NULL,
        block_type             TEXT NOT NULL DEFAULT 'prose',
        language               TEXT,
        content                TEXT NOT NULL DEFAULT '',
        start_offset           INTEGER NOT NULL DEFAULT 0,
        end_offset             INTEGER NOT NULL DEFAULT 0,
        gizmo_id               TEXT,
        created_at             INTEGER NOT NULL DEFAULT 0,
        metadata               TEXT NOT NULL DEFAULT '{}',
        embedding_id           TEXT
    );
    CREATE INDEX idx_content_blocks_message ON content_blocks(parent_message_id);

    CREATE TABLE chunks (
        id             TEXT PRIMARY KEY,
        thread_id      TEXT NOT NULL,
        message_id     TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        chunk_index    INTEGER NOT NULL,
        content        TEXT NOT NULL DEFAULT '',
        word_count     INTEGER NOT NULL DEFAULT 0,
        token_count    INTEGER NOT NULL DEFAULT 0,
        content_type   TEXT NOT NULL DEFAULT 'prose',
        language       TEXT,
        start_offset   INTEGER NOT NULL DEFAULT 0,
        end_offset     INTEGER NOT NULL DEFAULT 0,
        context_before TEXT,
        context_after  TEXT,
        pyramid        INTEGER NOT NULL DEFAULT 0,
        embedding_id   TEXT,
        UNIQUE (thread_id, chunk_index)
    );
    CREATE INDEX idx_chunks_message ON chunks(message_id);

    CREATE TABLE links (
        id            TEXT PRIMARY KEY,
        source_uri    TEXT NOT NULL,
        target_uri    TEXT NOT NULL,
        link_type     TEXT NOT NULL,
        link_strength REAL NOT NULL DEFAULT 1.0,
        source_span   TEXT,
        target_span   TEXT,
        label         TEXT,
        created_by    TEXT NOT NULL DEFAULT '',
        metadata      TEXT NOT NULL DEFAULT '{}',
        created_at    INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_links_source ON links(source_uri);
    CREATE INDEX idx_links_target ON links(target_uri);

    CREATE TABLE import_jobs (
        id              TEXT PRIMARY KEY,
        status          TEXT NOT NULL DEFAULT 'pending',
        source_type     TEXT NOT NULL DEFAULT '',
        source_path     TEXT NOT NULL DEFAULT '',
        source_name     TEXT NOT NULL DEFAULT '',
        progress        REAL NOT NULL DEFAULT 0.0,
        current_phase   TEXT NOT NULL DEFAULT '',
        current_item    TEXT NOT NULL DEFAULT '',
        units_total     INTEGER NOT NULL DEFAULT 0,
        units_processed INTEGER NOT NULL DEFAULT 0,
        media_total     INTEGER NOT NULL DEFAULT 0,
        media_processed INTEGER NOT NULL DEFAULT 0,
        errors_count    INTEGER NOT NULL DEFAULT 0,
        error_log       TEXT NOT NULL DEFAULT '[]',
        created_at_ms   INTEGER NOT NULL DEFAULT 0,
        started_at_ms   INTEGER,
        completed_at_ms INTEGER
    );

    CREATE TABLE image_analyses (
        id                 TEXT PRIMARY KEY,
        file_path          TEXT NOT NULL UNIQUE,
        file_hash          TEXT,
        source             TEXT NOT NULL DEFAULT '',
        description        TEXT NOT NULL DEFAULT '',
        categories         TEXT NOT NULL DEFAULT '[]',
        objects            TEXT NOT NULL DEFAULT '[]',
        scene              TEXT,
        mood               TEXT,
        model_used         TEXT NOT NULL DEFAULT '',
        confidence         REAL NOT NULL DEFAULT 0.0,
        processing_time_ms INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE message_embeddings (
        id        TEXT PRIMARY KEY,
        owner_id  TEXT NOT NULL UNIQUE REFERENCES messages(id) ON DELETE CASCADE,
        embedding BLOB NOT NULL,
        role      TEXT,
        source    TEXT,
        gizmo_id  TEXT
    );

    CREATE TABLE chunk_embeddings (
        id           TEXT PRIMARY KEY,
        owner_id     TEXT NOT NULL UNIQUE REFERENCES chunks(id) ON DELETE CASCADE,
        embedding    BLOB NOT NULL,
        content_type TEXT,
        source       TEXT
    );

    CREATE TABLE summary_embeddings (
        id        TEXT PRIMARY KEY,
        owner_id  TEXT NOT NULL UNIQUE REFERENCES conversations(id) ON DELETE CASCADE,
        embedding BLOB NOT NULL,
        source    TEXT
    );

    CREATE TABLE content_item_embeddings (
        id        TEXT PRIMARY KEY,
        owner_id  TEXT NOT NULL UNIQUE REFERENCES content_items(id) ON DELETE CASCADE,
        embedding BLOB NOT NULL,
        item_type TEXT,
        source    TEXT
    );

    CREATE TABLE content_block_embeddings (
        id         TEXT PRIMARY KEY,
        owner_id   TEXT NOT NULL UNIQUE REFERENCES content_blocks(id) ON DELETE CASCADE,
        embedding  BLOB NOT NULL,
        block_type TEXT,
        gizmo_id   TEXT
    );

    CREATE TABLE image_description_embeddings (
        id        TEXT PRIMARY KEY,
        owner_id  TEXT NOT NULL UNIQUE REFERENCES image_analyses(id) ON DELETE CASCADE,
        embedding BLOB NOT NULL,
        source    TEXT
    );

    CREATE VIRTUAL TABLE chunks_fts USING fts5(content, chunk_id UNINDEXED);
    CREATE TRIGGER chunks_fts_insert AFTER INSERT ON chunks BEGIN
        INSERT INTO chunks_fts (content, chunk_id) VALUES (new.content, new.id);
    END;
    CREATE TRIGGER chunks_fts_delete AFTER DELETE ON chunks BEGIN
        DELETE FROM chunks_fts WHERE chunk_id = old.id;
    END;

    CREATE VIRTUAL TABLE images_fts USING fts5(description, analysis_id UNINDEXED, source UNINDEXED);
    CREATE TRIGGER images_fts_insert AFTER INSERT ON image_analyses BEGIN
        INSERT INTO images_fts (description, analysis_id, source)
        VALUES (new.description, new.id, new.source);
    END;
    CREATE TRIGGER images_fts_update AFTER UPDATE OF description ON image_analyses BEGIN
        DELETE FROM images_fts WHERE analysis_id = old.id;
        INSERT INTO images_fts (description, analysis_id, source)
        VALUES (new.description, new.id, new.source);
    END;
    CREATE TRIGGER images_fts_delete AFTER DELETE ON image_analyses BEGIN
        DELETE FROM images_fts WHERE analysis_id = old.id;
    END;
    "#,
];
