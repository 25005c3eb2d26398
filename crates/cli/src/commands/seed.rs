use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::commands::CommandResult;
use procura_core::config::{AppConfig, LoadOptions};
use procura_core::documents::NoopDocumentPipeline;
use procura_core::domain::purchase_request::NewPurchaseRequest;
use procura_core::domain::user::{Role, User, UserId};
use procura_db::repositories::{SqlUserRepository, UserRepository};
use procura_db::{connect_with_settings, migrations, ApprovalEngine};

const SEED_USERS: &[(&str, &str, &str, Role, &str)] = &[
    ("seed-staff", "staff1", "Sala Kebede", Role::Staff, "operations"),
    ("seed-approver-l1", "approver1", "Meron Tadesse", Role::ApproverL1, "procurement"),
    ("seed-approver-l2", "approver2", "Daniel Haile", Role::ApproverL2, "finance"),
    ("seed-finance", "finance1", "Hanna Girma", Role::Finance, "finance"),
];

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let users = SqlUserRepository::new(pool.clone());
        for (id, username, full_name, role, department) in SEED_USERS {
            users
                .save(User {
                    id: UserId(id.to_string()),
                    username: username.to_string(),
                    full_name: full_name.to_string(),
                    role: *role,
                    department: department.to_string(),
                    created_at: Utc::now(),
                })
                .await
                .map_err(|error| ("seed_users", error.to_string(), 6u8))?;
        }

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM purchase_request")
            .fetch_one(&pool)
            .await
            .map_err(|error| ("seed_requests", error.to_string(), 6u8))?;
        if existing > 0 {
            pool.close().await;
            return Ok("seed users refreshed; requests already present".to_string());
        }

        let staff = seed_user(Role::Staff);
        let approver_one = seed_user(Role::ApproverL1);
        let approver_two = seed_user(Role::ApproverL2);
        let engine = ApprovalEngine::new(pool.clone(), Arc::new(NoopDocumentPipeline));

        // One request per interesting workflow state.
        engine
            .create_with_approvals(
                request("Office chairs", "Ergonomic chairs for the support floor", "450.00"),
                &staff,
            )
            .await
            .map_err(|error| ("seed_requests", error.to_string(), 6u8))?;

        let awaiting_second = engine
            .create_with_approvals(
                request("Server upgrade", "Memory and storage for the build server", "2300.00"),
                &staff,
            )
            .await
            .map_err(|error| ("seed_requests", error.to_string(), 6u8))?;
        engine
            .approve(&awaiting_second.request.id, &approver_one, "within budget")
            .await
            .map_err(|error| ("seed_requests", error.to_string(), 6u8))?;

        let rejected = engine
            .create_with_approvals(
                request("Espresso machine", "Premium espresso machine for the lobby", "3200.00"),
                &staff,
            )
            .await
            .map_err(|error| ("seed_requests", error.to_string(), 6u8))?;
        engine
            .reject(&rejected.request.id, &approver_two, "not a business need")
            .await
            .map_err(|error| ("seed_requests", error.to_string(), 6u8))?;

        pool.close().await;
        Ok::<String, (&'static str, String, u8)>(
            "seeded 4 users and 3 purchase requests".to_string(),
        )
    });

    match result {
        Ok(message) => CommandResult::success("seed", message),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn seed_user(role: Role) -> User {
    let (id, username, full_name, _, department) = SEED_USERS
        .iter()
        .find(|(_, _, _, seeded_role, _)| *seeded_role == role)
        .expect("seed users cover every role");

    User {
        id: UserId(id.to_string()),
        username: username.to_string(),
        full_name: full_name.to_string(),
        role,
        department: department.to_string(),
        created_at: Utc::now(),
    }
}

fn request(title: &str, description: &str, amount: &str) -> NewPurchaseRequest {
    NewPurchaseRequest {
        title: title.to_string(),
        description: description.to_string(),
        amount: amount.parse::<Decimal>().unwrap_or(Decimal::ONE),
        proforma: None,
    }
}
