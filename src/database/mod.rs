use diesel::{
    Connection, PgConnection, SqliteConnection,
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection},
    result::{DatabaseErrorKind, Error as DieselError},
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::fs::File;
use std::path::Path;

use crate::controller::BaseError;

pub mod model_catalog;
pub mod provider;
pub mod provider_model;

pub enum DbType {
    Postgres,
    Sqlite,
}

/// Connection pool handed to every store call. Cloning shares the pool.
#[derive(Clone)]
pub enum DbPool {
    Postgres(Pool<ConnectionManager<PgConnection>>),
    Sqlite(Pool<ConnectionManager<SqliteConnection>>),
}

pub enum DbConnection {
    Postgres(PooledConnection<ConnectionManager<PgConnection>>),
    Sqlite(PooledConnection<ConnectionManager<SqliteConnection>>),
}

fn parse_db_type(db_url: &str) -> DbType {
    if db_url.starts_with("postgres") {
        DbType::Postgres
    } else {
        DbType::Sqlite
    }
}

impl DbPool {
    pub fn establish(db_url: &str) -> DbResult<Self> {
        match parse_db_type(db_url) {
            DbType::Postgres => Ok(DbPool::Postgres(init_pg_pool(db_url)?)),
            DbType::Sqlite => Ok(DbPool::Sqlite(init_sqlite_pool(db_url)?)),
        }
    }

    pub fn get_connection(&self) -> DbResult<DbConnection> {
        let conn = match self {
            DbPool::Postgres(pool) => pool.get().map(DbConnection::Postgres),
            DbPool::Sqlite(pool) => pool.get().map(DbConnection::Sqlite),
        };
        conn.map_err(|e| BaseError::DatabaseFatal(Some(format!("failed to get db connection: {}", e))))
    }
}

#[path = "../schema/sqlite.rs"]
pub mod _sqlite_schema;

#[path = "../schema/postgres.rs"]
pub mod _postgres_schema;

#[macro_export]
macro_rules! db_object {
    (
        $(
            $( #[$attr:meta] )*
            pub struct $name:ident {
                $( $( #[$field_attr:meta] )* $vis:vis $field:ident : $typ:ty ),+
                $(,)?
            }
        )+
    ) => {
        $(
            #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
            pub struct $name { $( $vis $field : $typ, )+ }
        )+

        pub mod _postgres_model {
            $( $crate::db_object! { @expand postgres |  $( #[$attr] )* | $name |  $( $( #[$field_attr] )* $field : $typ ),+ } )+
        }
        pub mod _sqlite_model {
            $( $crate::db_object! { @expand sqlite |  $( #[$attr] )* | $name |  $( $( #[$field_attr] )* $field : $typ ),+ } )+
        }
    };
    ( @expand $db_type:ident | $( #[$attr:meta] )* | $name:ident | $( $( #[$field_attr:meta] )* $vis:vis $field:ident : $typ:ty),+) => {
        paste::paste! {
            #[allow(unused_imports)] use super::*;
            #[allow(unused_imports)] use crate::database::[<_ $db_type _schema>]::*;
            #[allow(unused_imports)] use diesel::prelude::*;

            $( #[$attr] )*
            pub struct [<$name Db>] { $(
                $( #[$field_attr] )* $vis $field : $typ,
            )+ }

            impl [<$name Db>] {
                #[inline(always)]
                pub fn from_db(self) -> super::$name {
                    super::$name { $( $field: self.$field, )+ }
                }

                #[inline(always)]
                pub fn to_db(x: &super::$name) -> Self {
                    Self {
                        $( $field: x.$field.clone(), )+
                    }
                }
            }
        }
    }
}

#[macro_export]
macro_rules! db_execute {
    ($conn:ident, $block:block) => {
        match $conn {
            crate::database::DbConnection::Postgres($conn) => {
                use crate::database::_postgres_schema::*;
                #[allow(unused_imports)]
                use _postgres_model::*;
                #[allow(unused_imports)]
                use diesel::prelude::*;

                $block
            }
            crate::database::DbConnection::Sqlite($conn) => {
                use crate::database::_sqlite_schema::*;
                #[allow(unused_imports)]
                use _sqlite_model::*;
                #[allow(unused_imports)]
                use diesel::prelude::*;

                $block
            }
        }
    };
}

const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");
const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

/// Applied to every pooled SQLite connection so concurrent writers wait instead of failing.
#[derive(Debug)]
struct SqliteConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqliteConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

fn fatal(context: &str, e: impl std::fmt::Display) -> BaseError {
    BaseError::DatabaseFatal(Some(format!("{}: {}", context, e)))
}

fn init_sqlite_pool(db_url: &str) -> DbResult<Pool<ConnectionManager<SqliteConnection>>> {
    let db_path = Path::new(db_url);
    if !db_path.exists() {
        if let Some(parent_dir) = db_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                std::fs::create_dir_all(parent_dir)
                    .map_err(|e| fatal("failed to create database directory", e))?;
            }
        }
        File::create(db_path).map_err(|e| fatal("failed to create database file", e))?;
    }

    let mut connection = SqliteConnection::establish(db_url)
        .map_err(|e| fatal("failed to establish migration connection", e))?;
    connection
        .run_pending_migrations(SQLITE_MIGRATIONS)
        .map_err(|e| fatal("failed to run migrations", e))?;

    let manager = ConnectionManager::<SqliteConnection>::new(db_url);
    Pool::builder()
        .test_on_check_out(true)
        .max_size(8)
        .connection_customizer(Box::new(SqliteConnectionOptions))
        .build(manager)
        .map_err(|e| fatal("failed to create pool", e))
}

fn init_pg_pool(db_url: &str) -> DbResult<Pool<ConnectionManager<PgConnection>>> {
    let mut connection = PgConnection::establish(db_url)
        .map_err(|e| fatal("failed to establish migration connection", e))?;
    connection
        .run_pending_migrations(POSTGRES_MIGRATIONS)
        .map_err(|e| fatal("failed to run migrations", e))?;

    let manager = ConnectionManager::<PgConnection>::new(db_url);
    Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(|e| fatal("failed to create pool", e))
}

pub type DbResult<T> = Result<T, BaseError>;

pub fn is_unique_violation(e: &DieselError) -> bool {
    matches!(e, DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))
}
