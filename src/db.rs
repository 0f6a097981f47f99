//! SQLite persistence, following the teacher's `Db` shape: a single
//! `Mutex<Connection>` behind idempotent migrations run once at startup.

use rusqlite::Connection;
use std::sync::Mutex;

pub struct Db {
    pub conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Idempotent migration: `CREATE TABLE IF NOT EXISTS` for new tables,
    /// guarded `ALTER TABLE ... ADD COLUMN` for columns added later. Errors
    /// from an ALTER against an already-migrated DB are swallowed via `.ok()`
    /// the way the teacher's `Db::migrate` does it.
    fn migrate(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                plan_tier TEXT NOT NULL DEFAULT 'free',
                phone_number_id TEXT,
                display_phone_number TEXT,
                waba_id TEXT,
                bsp_connected INTEGER NOT NULL DEFAULT 0,
                phone_health TEXT NOT NULL DEFAULT 'PENDING',
                quality_rating TEXT NOT NULL DEFAULT 'UNKNOWN',
                messaging_tier INTEGER NOT NULL DEFAULT 0,
                account_status TEXT NOT NULL DEFAULT 'active',
                decision_status TEXT,
                capability_blocked INTEGER NOT NULL DEFAULT 0,
                billing_status TEXT NOT NULL DEFAULT 'trial',
                trial_allows_send INTEGER NOT NULL DEFAULT 1,
                messages_today INTEGER NOT NULL DEFAULT 0,
                messages_month INTEGER NOT NULL DEFAULT 0,
                template_submissions_today INTEGER NOT NULL DEFAULT 0,
                usage_day TEXT NOT NULL DEFAULT '',
                usage_month TEXT NOT NULL DEFAULT '',
                rate_limit_overrides TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_workspaces_phone_number_id
                ON workspaces(phone_number_id) WHERE phone_number_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                phone TEXT NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                opted_in INTEGER NOT NULL DEFAULT 1,
                opt_via TEXT NOT NULL DEFAULT 'implicit',
                opt_at TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_workspace_phone
                ON contacts(workspace_id, phone);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'open',
                conversation_type TEXT NOT NULL DEFAULT 'customer_initiated',
                last_activity_at TEXT NOT NULL,
                last_customer_message_at TEXT,
                started_at TEXT NOT NULL,
                assigned_agent TEXT,
                sla_deadline TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_workspace_contact
                ON conversations(workspace_id, contact_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                provider_message_id TEXT,
                direction TEXT NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'text',
                body TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                template_json TEXT,
                campaign_id TEXT,
                media_json TEXT,
                failure_reason TEXT,
                queued_at TEXT,
                sending_at TEXT,
                sent_at TEXT,
                delivered_at TEXT,
                read_at TEXT,
                failed_at TEXT,
                received_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_provider_message_id
                ON messages(provider_message_id) WHERE provider_message_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_messages_campaign
                ON messages(campaign_id) WHERE campaign_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                language TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'UTILITY',
                components TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'PENDING',
                provider_template_id TEXT,
                provider_name TEXT NOT NULL DEFAULT '',
                rejection_category TEXT,
                rejection_reason TEXT,
                original_template_id TEXT,
                approval_history TEXT NOT NULL DEFAULT '[]',
                last_webhook_event_id TEXT,
                last_webhook_update TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_templates_workspace_name_lang
                ON templates(workspace_id, name, language);
            CREATE INDEX IF NOT EXISTS idx_templates_provider_template_id
                ON templates(provider_template_id) WHERE provider_template_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS webhook_logs (
                id TEXT PRIMARY KEY,
                delivery_id TEXT,
                event_type TEXT NOT NULL,
                workspace_id TEXT,
                phone_id TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                verified INTEGER NOT NULL DEFAULT 0,
                bsp_routed INTEGER NOT NULL DEFAULT 1,
                error TEXT,
                redacted_payload TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_webhook_logs_delivery
                ON webhook_logs(delivery_id) WHERE delivery_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_webhook_logs_created_at
                ON webhook_logs(created_at);

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'running',
                pause_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_workspace_status
                ON campaigns(workspace_id, status);

            CREATE TABLE IF NOT EXISTS campaign_batches (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'running',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaign_batches_campaign
                ON campaign_batches(campaign_id);

            CREATE TABLE IF NOT EXISTS campaign_messages (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                provider_message_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaign_messages_campaign
                ON campaign_messages(campaign_id);

            CREATE TABLE IF NOT EXISTS usage_ledger (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                conversation_id TEXT,
                contact_id TEXT,
                direction TEXT NOT NULL,
                template_category TEXT,
                billable INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_ledger_workspace_created
                ON usage_ledger(workspace_id, created_at);

            CREATE TABLE IF NOT EXISTS killswitch_events (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                reason TEXT NOT NULL,
                paused_campaign_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                ttl_expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_killswitch_events_workspace
                ON killswitch_events(workspace_id);

            CREATE TABLE IF NOT EXISTS global_killswitch (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                active INTEGER NOT NULL DEFAULT 0,
                reason TEXT,
                actor TEXT,
                activated_at TEXT,
                ttl_expires_at TEXT
            );

            CREATE TABLE IF NOT EXISTS auto_replies (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                keyword TEXT NOT NULL,
                match_type TEXT NOT NULL DEFAULT 'exact',
                template_id TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                order_idx INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_auto_replies_workspace
                ON auto_replies(workspace_id, order_idx);

            CREATE TABLE IF NOT EXISTS auto_reply_log (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                auto_reply_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS faqs (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                question TEXT NOT NULL,
                variations TEXT NOT NULL DEFAULT '[]',
                answer TEXT NOT NULL,
                approved INTEGER NOT NULL DEFAULT 0,
                match_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_faqs_workspace
                ON faqs(workspace_id);
            ",
        )?;

        // Columns added after the initial release. Each ALTER is allowed to
        // fail (column already exists) and the error is discarded.
        conn.execute("ALTER TABLE workspaces ADD COLUMN capability_blocked INTEGER NOT NULL DEFAULT 0", [])
            .ok();
        conn.execute("ALTER TABLE templates ADD COLUMN last_webhook_event_type TEXT", [])
            .ok();
        conn.execute("ALTER TABLE templates ADD COLUMN active_version INTEGER NOT NULL DEFAULT 1", [])
            .ok();
        conn.execute(
            "INSERT OR IGNORE INTO global_killswitch (id, active) VALUES (1, 0)",
            [],
        )
        .ok();

        Ok(())
    }
}
