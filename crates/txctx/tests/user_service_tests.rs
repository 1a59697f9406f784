//! A business service written against `Session` with its own error type

use anyhow::{bail, Context as _};

use txctx::{Context, Error, ExecResult, QueryExecutor, Row, Session};
use txctx_testing::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct User {
    id: i64,
    email: String,
}

struct UserService {
    session: Session,
}

impl UserService {
    fn new(session: Session) -> Self {
        Self { session }
    }

    async fn create_user(&self, ctx: &Context, email: &str) -> anyhow::Result<i64> {
        let executor = self.session.query_executor(ctx);

        let existing = executor
            .query(ctx, "SELECT id FROM users WHERE email = $1", &[email.into()])
            .await?;
        if !existing.is_empty() {
            bail!("email {} is already registered", email);
        }

        let result = executor
            .execute(ctx, "INSERT INTO users (email) VALUES ($1)", &[email.into()])
            .await
            .context("inserting user")?;
        result.last_insert_id.context("driver returned no id")
    }

    async fn find_user(&self, ctx: &Context, id: i64) -> anyhow::Result<Option<User>> {
        let row = match self
            .session
            .query_executor(ctx)
            .query_row(ctx, "SELECT id, email FROM users WHERE id = $1", &[id.into()])
            .await
        {
            Ok(row) => row,
            Err(Error::NoRows) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(User {
            id: row.get("id")?,
            email: row.get("email")?,
        }))
    }

    /// Create a user and its profile atomically
    async fn register(&self, ctx: &Context, email: &str, bio: &str) -> anyhow::Result<i64> {
        self.session
            .transaction(ctx, |ctx| async move {
                let id = self.create_user(&ctx, email).await?;
                self.session
                    .query_executor(&ctx)
                    .execute(
                        &ctx,
                        "INSERT INTO profiles (user_id, bio) VALUES ($1, $2)",
                        &[id.into(), bio.into()],
                    )
                    .await?;
                Ok::<_, anyhow::Error>(id)
            })
            .await
    }
}

fn user_row(id: i64, email: &str) -> Row {
    Row::new(vec!["id".into(), "email".into()], vec![id.into(), email.into()])
}

#[tokio::test]
async fn test_register_commits_user_and_profile() {
    init_tracing();
    let mock = MockDatabase::new();
    let service = UserService::new(mock.session(None));

    mock.expect_begin();
    mock.expect_query("SELECT id FROM users").with_args(["ada@example.com"]);
    mock.expect_exec("INSERT INTO users")
        .with_args(["ada@example.com"])
        .will_return_result(ExecResult::new(12, 1));
    mock.expect_exec("INSERT INTO profiles").will_return_result(ExecResult::affected(1));
    mock.expect_commit();

    let id = service
        .register(&Context::background(), "ada@example.com", "Analyst")
        .await
        .unwrap();

    assert_eq!(id, 12);
    assert_eq!(mock.commit_count(), 1);
    mock.expectations_were_met().unwrap();
}

#[tokio::test]
async fn test_register_duplicate_email_rolls_back() {
    init_tracing();
    let mock = MockDatabase::new();
    let service = UserService::new(mock.session(None));

    mock.expect_begin();
    mock.expect_query("SELECT id FROM users")
        .will_return_rows(vec![Row::from_pairs([("id", 3i64)])]);
    mock.expect_rollback();

    let err = service
        .register(&Context::background(), "ada@example.com", "Analyst")
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "email ada@example.com is already registered");
    assert_eq!(mock.commit_count(), 0);
    assert_eq!(mock.rollback_count(), 1);
    mock.expectations_were_met().unwrap();
}

#[tokio::test]
async fn test_register_driver_error_keeps_cause() {
    init_tracing();
    let mock = MockDatabase::new();
    let service = UserService::new(mock.session(None));

    mock.expect_begin();
    mock.expect_query("SELECT id FROM users");
    mock.expect_exec("INSERT INTO users")
        .will_return_error(Error::database_with_code("23505", "duplicate key"));
    mock.expect_rollback();

    let err = service
        .register(&Context::background(), "ada@example.com", "Analyst")
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "inserting user");
    let cause = err.downcast_ref::<Error>().unwrap();
    assert_eq!(cause.code(), Some("23505"));
    mock.expectations_were_met().unwrap();
}

#[tokio::test]
async fn test_register_begin_error_converts_into_anyhow() {
    init_tracing();
    let mock = MockDatabase::new();
    let service = UserService::new(mock.session(None));

    mock.expect_begin()
        .will_return_error(Error::Connection("pool exhausted".to_string()));

    let err = service
        .register(&Context::background(), "ada@example.com", "Analyst")
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<Error>(),
        Some(&Error::Connection("pool exhausted".to_string()))
    );
    assert!(mock.events().is_empty());
}

#[tokio::test]
async fn test_service_outside_transaction_uses_connection() {
    init_tracing();
    let mock = MockDatabase::new();
    let service = UserService::new(mock.session(None));

    mock.expect_query("SELECT id FROM users");
    mock.expect_exec("INSERT INTO users").will_return_result(ExecResult::new(5, 1));
    mock.expect_query("SELECT id, email FROM users")
        .with_args([5i64])
        .will_return_rows(vec![user_row(5, "grace@example.com")]);
    mock.expect_query("SELECT id, email FROM users").with_args([6i64]);

    let ctx = Context::background();
    let id = service.create_user(&ctx, "grace@example.com").await.unwrap();
    let user = service.find_user(&ctx, id).await.unwrap();
    let missing = service.find_user(&ctx, 6).await.unwrap();

    assert_eq!(
        user,
        Some(User {
            id: 5,
            email: "grace@example.com".to_string(),
        })
    );
    assert_eq!(missing, None);
    assert!(mock
        .events()
        .iter()
        .all(|event| matches!(event, MockEvent::Exec { tx: None, .. } | MockEvent::Query { tx: None, .. })));
    mock.expectations_were_met().unwrap();
}
