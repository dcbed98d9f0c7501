#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskhive_domain::{
	MessageId, OrganizationId, ParseIdError, Principal, PrincipalId, PrivatePair, Room, RoomId, RoomKind, RoomSummary,
	StoredMessage,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration failed: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("unsupported database_url (use sqlite: or postgres:): {0}")]
	UnsupportedUrl(String),

	#[error("room {0} not found")]
	RoomNotFound(RoomId),

	#[error("stored row is invalid: {0}")]
	Corrupt(String),
}

impl From<ParseIdError> for StoreError {
	fn from(e: ParseIdError) -> Self {
		StoreError::Corrupt(e.to_string())
	}
}

/// Durable rooms, memberships and messages.
#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
	/// Atomic get-or-create on the pair's canonical key.
	async fn get_or_create_private_room(
		&self,
		pair: PrivatePair,
		organization: Option<OrganizationId>,
	) -> Result<Room, StoreError>;

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError>;

	/// Idempotent.
	async fn add_members(&self, room: RoomId, principals: &[PrincipalId]) -> Result<(), StoreError>;

	async fn members(&self, room: RoomId) -> Result<Vec<PrincipalId>, StoreError>;

	/// Oldest first, ordered by `(created_at, id)`.
	async fn list_messages(&self, room: RoomId) -> Result<Vec<StoredMessage>, StoreError>;

	async fn create_message(&self, sender: &Principal, content: &str, room: RoomId) -> Result<StoredMessage, StoreError>;

	async fn create_group_room(
		&self,
		name: Option<&str>,
		organization: Option<OrganizationId>,
		members: &[PrincipalId],
	) -> Result<Room, StoreError>;

	/// Latest activity first; rooms without messages last.
	async fn rooms_for_member(&self, principal: PrincipalId) -> Result<Vec<RoomSummary>, StoreError>;

	async fn ping(&self) -> Result<(), StoreError>;
}

/// Open the store named by `database_url`; `None` or `memory` selects the in-memory store.
pub async fn connect_store(database_url: Option<&str>) -> Result<Arc<dyn ChatStore>, StoreError> {
	match database_url.map(str::trim) {
		None | Some("") | Some("memory") => {
			info!("chat store: in-memory (messages are lost on restart)");
			Ok(Arc::new(InMemoryChatStore::new()))
		}
		Some(url) => Ok(Arc::new(SqlChatStore::connect(url).await?)),
	}
}

fn default_group_name(existing_rooms: usize) -> String {
	format!("Group {}", existing_rooms + 1)
}

fn clean_name(name: Option<&str>) -> Option<String> {
	name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string)
}

fn ts_from_micros(us: i64) -> Result<DateTime<Utc>, StoreError> {
	DateTime::from_timestamp_micros(us).ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {us}")))
}

/// Next timestamp for a room: now, but always strictly after the previous message.
fn next_timestamp_micros(last: Option<i64>) -> i64 {
	let now = Utc::now().timestamp_micros();
	match last {
		Some(last) if now <= last => last + 1,
		_ => now,
	}
}

fn order_summaries(summaries: &mut [RoomSummary]) {
	summaries.sort_by(|a, b| match (a.last_message_at, b.last_message_at) {
		(Some(x), Some(y)) => y.cmp(&x).then(b.room.id.cmp(&a.room.id)),
		(Some(_), None) => std::cmp::Ordering::Less,
		(None, Some(_)) => std::cmp::Ordering::Greater,
		(None, None) => b.room.id.cmp(&a.room.id),
	});
}

fn summarize(room: Room, last_message_at: Option<DateTime<Utc>>, viewer: PrincipalId) -> RoomSummary {
	let other_member = room.private_pair().and_then(|pair| pair.other(viewer));
	RoomSummary {
		room,
		last_message_at,
		other_member,
	}
}

/// Process-local store guarded by one async mutex.
#[derive(Debug, Default)]
pub struct InMemoryChatStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
	rooms: BTreeMap<RoomId, MemoryRoom>,
	private_index: HashMap<PrivatePair, RoomId>,
	next_room_id: i64,
	next_message_id: i64,
}

#[derive(Debug)]
struct MemoryRoom {
	room: Room,
	members: BTreeSet<PrincipalId>,
	messages: Vec<StoredMessage>,
}

impl MemoryInner {
	fn insert_room(&mut self, name: Option<String>, kind: RoomKind, organization: Option<OrganizationId>) -> Result<Room, StoreError> {
		self.next_room_id += 1;
		let room = Room {
			id: RoomId::new(self.next_room_id)?,
			name,
			kind,
			organization,
		};
		self.rooms.insert(
			room.id,
			MemoryRoom {
				room: room.clone(),
				members: BTreeSet::new(),
				messages: Vec::new(),
			},
		);
		Ok(room)
	}
}

impl InMemoryChatStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl ChatStore for InMemoryChatStore {
	async fn get_or_create_private_room(
		&self,
		pair: PrivatePair,
		organization: Option<OrganizationId>,
	) -> Result<Room, StoreError> {
		let mut inner = self.inner.lock().await;
		if let Some(id) = inner.private_index.get(&pair).copied()
			&& let Some(existing) = inner.rooms.get(&id)
		{
			return Ok(existing.room.clone());
		}

		let room = inner.insert_room(Some(pair.key()), RoomKind::Private { pair }, organization)?;
		inner.private_index.insert(pair, room.id);
		Ok(room)
	}

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(&id).map(|r| r.room.clone()))
	}

	async fn add_members(&self, room: RoomId, principals: &[PrincipalId]) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.get_mut(&room).ok_or(StoreError::RoomNotFound(room))?;
		entry.members.extend(principals.iter().copied());
		Ok(())
	}

	async fn members(&self, room: RoomId) -> Result<Vec<PrincipalId>, StoreError> {
		let inner = self.inner.lock().await;
		let entry = inner.rooms.get(&room).ok_or(StoreError::RoomNotFound(room))?;
		Ok(entry.members.iter().copied().collect())
	}

	async fn list_messages(&self, room: RoomId) -> Result<Vec<StoredMessage>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(&room).map(|r| r.messages.clone()).unwrap_or_default())
	}

	async fn create_message(&self, sender: &Principal, content: &str, room: RoomId) -> Result<StoredMessage, StoreError> {
		let mut inner = self.inner.lock().await;
		inner.next_message_id += 1;
		let id = MessageId::new(inner.next_message_id)?;

		let entry = inner.rooms.get_mut(&room).ok_or(StoreError::RoomNotFound(room))?;
		let last = entry.messages.last().map(|m| m.created_at.timestamp_micros());

		let msg = StoredMessage {
			id,
			room,
			sender_id: sender.id,
			sender_name: sender.username.clone(),
			content: content.to_string(),
			created_at: ts_from_micros(next_timestamp_micros(last))?,
			organization: entry.room.organization,
		};
		entry.messages.push(msg.clone());
		Ok(msg)
	}

	async fn create_group_room(
		&self,
		name: Option<&str>,
		organization: Option<OrganizationId>,
		members: &[PrincipalId],
	) -> Result<Room, StoreError> {
		let mut inner = self.inner.lock().await;
		let name = clean_name(name).unwrap_or_else(|| default_group_name(inner.rooms.len()));
		let room = inner.insert_room(Some(name), RoomKind::Group, organization)?;
		if let Some(entry) = inner.rooms.get_mut(&room.id) {
			entry.members.extend(members.iter().copied());
		}
		Ok(room)
	}

	async fn rooms_for_member(&self, principal: PrincipalId) -> Result<Vec<RoomSummary>, StoreError> {
		let inner = self.inner.lock().await;
		let mut out = inner
			.rooms
			.values()
			.filter(|r| r.members.contains(&principal))
			.map(|r| summarize(r.room.clone(), r.messages.last().map(|m| m.created_at), principal))
			.collect::<Vec<_>>();
		order_summaries(&mut out);
		Ok(out)
	}

	async fn ping(&self) -> Result<(), StoreError> {
		Ok(())
	}
}

/// sqlx-backed store for `sqlite:` and `postgres:` URLs.
#[derive(Clone)]
pub struct SqlChatStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type RoomRow = (i64, Option<String>, Option<String>, Option<i64>);
type MessageRow = (i64, i64, i64, String, String, Option<i64>, i64);

fn room_from_row((id, name, private_key, organization): RoomRow) -> Result<Room, StoreError> {
	let kind = match private_key {
		Some(key) => RoomKind::Private {
			pair: PrivatePair::parse_key(&key)?,
		},
		None => RoomKind::Group,
	};
	Ok(Room {
		id: RoomId::new(id)?,
		name,
		kind,
		organization: organization.map(OrganizationId::new).transpose()?,
	})
}

fn message_from_row(
	(id, room, sender_id, sender_name, content, organization, created_us): MessageRow,
) -> Result<StoredMessage, StoreError> {
	Ok(StoredMessage {
		id: MessageId::new(id)?,
		room: RoomId::new(room)?,
		sender_id: PrincipalId::new(sender_id)?,
		sender_name,
		content,
		created_at: ts_from_micros(created_us)?,
		organization: organization.map(OrganizationId::new).transpose()?,
	})
}

const ROOMS_FOR_MEMBER_SQLITE: &str = "SELECT r.id, r.name, r.private_key, r.organization_id, MAX(m.created_at_us) \
	FROM chat_rooms r \
	JOIN chat_room_members rm ON rm.room_id = r.id \
	LEFT JOIN chat_messages m ON m.room_id = r.id \
	WHERE rm.principal_id = ? \
	GROUP BY r.id, r.name, r.private_key, r.organization_id";

const ROOMS_FOR_MEMBER_POSTGRES: &str = "SELECT r.id, r.name, r.private_key, r.organization_id, MAX(m.created_at_us) \
	FROM chat_rooms r \
	JOIN chat_room_members rm ON rm.room_id = r.id \
	LEFT JOIN chat_messages m ON m.room_id = r.id \
	WHERE rm.principal_id = $1 \
	GROUP BY r.id, r.name, r.private_key, r.organization_id";

impl SqlChatStore {
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		if database_url.starts_with("sqlite:") {
			let opts = sqlx::sqlite::SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
			// Each connection to `:memory:` is a separate database.
			let pool = if database_url.contains(":memory:") {
				sqlx::sqlite::SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
					.connect_with(opts)
					.await?
			} else {
				sqlx::sqlite::SqlitePoolOptions::new()
					.max_connections(8)
					.connect_with(opts)
					.await?
			};
			sqlx::migrate!("migrations/sqlite").run(&pool).await?;

			info!("chat store: sqlite");
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await?;
			sqlx::migrate!("migrations/postgres").run(&pool).await?;

			info!("chat store: postgres");
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(StoreError::UnsupportedUrl(database_url.to_string()))
		}
	}

	async fn add_members_unchecked(&self, room: RoomId, principals: &[PrincipalId]) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				for p in principals {
					sqlx::query(
						"INSERT INTO chat_room_members (room_id, principal_id) VALUES (?, ?) \
						ON CONFLICT(room_id, principal_id) DO NOTHING",
					)
					.bind(room.get())
					.bind(p.get())
					.execute(&mut *tx)
					.await?;
				}
				tx.commit().await?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				for p in principals {
					sqlx::query(
						"INSERT INTO chat_room_members (room_id, principal_id) VALUES ($1, $2) \
						ON CONFLICT (room_id, principal_id) DO NOTHING",
					)
					.bind(room.get())
					.bind(p.get())
					.execute(&mut *tx)
					.await?;
				}
				tx.commit().await?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
impl SqlChatStore {
	/// Run one raw statement against the backing database.
	pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(sql).execute(pool).await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(sql).execute(pool).await?;
			}
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl ChatStore for SqlChatStore {
	async fn get_or_create_private_room(
		&self,
		pair: PrivatePair,
		organization: Option<OrganizationId>,
	) -> Result<Room, StoreError> {
		let key = pair.key();
		let now = Utc::now().timestamp();
		let org = organization.map(OrganizationId::get);

		let row: RoomRow = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO chat_rooms (name, private_key, organization_id, created_at) VALUES (?, ?, ?, ?) \
					ON CONFLICT(private_key) DO NOTHING",
				)
				.bind(&key)
				.bind(&key)
				.bind(org)
				.bind(now)
				.execute(pool)
				.await?;

				sqlx::query_as("SELECT id, name, private_key, organization_id FROM chat_rooms WHERE private_key = ?")
					.bind(&key)
					.fetch_one(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO chat_rooms (name, private_key, organization_id, created_at) VALUES ($1, $2, $3, $4) \
					ON CONFLICT (private_key) DO NOTHING",
				)
				.bind(&key)
				.bind(&key)
				.bind(org)
				.bind(now)
				.execute(pool)
				.await?;

				sqlx::query_as("SELECT id, name, private_key, organization_id FROM chat_rooms WHERE private_key = $1")
					.bind(&key)
					.fetch_one(pool)
					.await?
			}
		};

		room_from_row(row)
	}

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
		let row: Option<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, name, private_key, organization_id FROM chat_rooms WHERE id = ?")
					.bind(id.get())
					.fetch_optional(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, name, private_key, organization_id FROM chat_rooms WHERE id = $1")
					.bind(id.get())
					.fetch_optional(pool)
					.await?
			}
		};
		row.map(room_from_row).transpose()
	}

	async fn add_members(&self, room: RoomId, principals: &[PrincipalId]) -> Result<(), StoreError> {
		if self.get_room(room).await?.is_none() {
			return Err(StoreError::RoomNotFound(room));
		}
		self.add_members_unchecked(room, principals).await
	}

	async fn members(&self, room: RoomId) -> Result<Vec<PrincipalId>, StoreError> {
		if self.get_room(room).await?.is_none() {
			return Err(StoreError::RoomNotFound(room));
		}

		let rows: Vec<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT principal_id FROM chat_room_members WHERE room_id = ? ORDER BY principal_id")
					.bind(room.get())
					.fetch_all(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT principal_id FROM chat_room_members WHERE room_id = $1 ORDER BY principal_id")
					.bind(room.get())
					.fetch_all(pool)
					.await?
			}
		};

		rows.into_iter()
			.map(|(id,)| PrincipalId::new(id).map_err(StoreError::from))
			.collect()
	}

	async fn list_messages(&self, room: RoomId) -> Result<Vec<StoredMessage>, StoreError> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, room_id, sender_id, sender_name, content, organization_id, created_at_us \
					FROM chat_messages WHERE room_id = ? ORDER BY created_at_us ASC, id ASC",
				)
				.bind(room.get())
				.fetch_all(pool)
				.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, room_id, sender_id, sender_name, content, organization_id, created_at_us \
					FROM chat_messages WHERE room_id = $1 ORDER BY created_at_us ASC, id ASC",
				)
				.bind(room.get())
				.fetch_all(pool)
				.await?
			}
		};

		rows.into_iter().map(message_from_row).collect()
	}

	async fn create_message(&self, sender: &Principal, content: &str, room: RoomId) -> Result<StoredMessage, StoreError> {
		let now_us = Utc::now().timestamp_micros();

		let (id, org, created_us): (i64, Option<i64>, i64) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let org: Option<(Option<i64>,)> = sqlx::query_as("SELECT organization_id FROM chat_rooms WHERE id = ?")
					.bind(room.get())
					.fetch_optional(pool)
					.await?;
				let Some((org,)) = org else {
					return Err(StoreError::RoomNotFound(room));
				};

				// Single statement: sqlite serializes writers, so the timestamp read and insert are atomic.
				let (id, created_us): (i64, i64) = sqlx::query_as(
					"INSERT INTO chat_messages (room_id, sender_id, sender_name, content, organization_id, created_at_us) \
					SELECT ?, ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(created_at_us) FROM chat_messages WHERE room_id = ?), 0) + 1) \
					RETURNING id, created_at_us",
				)
				.bind(room.get())
				.bind(sender.id.get())
				.bind(&sender.username)
				.bind(content)
				.bind(org)
				.bind(now_us)
				.bind(room.get())
				.fetch_one(pool)
				.await?;
				(id, org, created_us)
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let org: Option<(Option<i64>,)> =
					sqlx::query_as("SELECT organization_id FROM chat_rooms WHERE id = $1 FOR UPDATE")
						.bind(room.get())
						.fetch_optional(&mut *tx)
						.await?;
				let Some((org,)) = org else {
					return Err(StoreError::RoomNotFound(room));
				};

				let (id, created_us): (i64, i64) = sqlx::query_as(
					"INSERT INTO chat_messages (room_id, sender_id, sender_name, content, organization_id, created_at_us) \
					SELECT $1, $2, $3, $4, $5, GREATEST($6, COALESCE((SELECT MAX(created_at_us) FROM chat_messages WHERE room_id = $1), 0) + 1) \
					RETURNING id, created_at_us",
				)
				.bind(room.get())
				.bind(sender.id.get())
				.bind(&sender.username)
				.bind(content)
				.bind(org)
				.bind(now_us)
				.fetch_one(&mut *tx)
				.await?;
				tx.commit().await?;
				(id, org, created_us)
			}
		};

		message_from_row((
			id,
			room.get(),
			sender.id.get(),
			sender.username.clone(),
			content.to_string(),
			org,
			created_us,
		))
	}

	async fn create_group_room(
		&self,
		name: Option<&str>,
		organization: Option<OrganizationId>,
		members: &[PrincipalId],
	) -> Result<Room, StoreError> {
		let now = Utc::now().timestamp();
		let org = organization.map(OrganizationId::get);

		// Room and memberships commit together; a failed member insert leaves no orphan room.
		let row: RoomRow = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				let name = match clean_name(name) {
					Some(n) => n,
					None => {
						let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chat_rooms")
							.fetch_one(&mut *tx)
							.await?;
						default_group_name(count as usize)
					}
				};
				let row: RoomRow = sqlx::query_as(
					"INSERT INTO chat_rooms (name, private_key, organization_id, created_at) VALUES (?, NULL, ?, ?) \
					RETURNING id, name, private_key, organization_id",
				)
				.bind(name)
				.bind(org)
				.bind(now)
				.fetch_one(&mut *tx)
				.await?;
				let room_id = row.0;
				for p in members {
					sqlx::query(
						"INSERT INTO chat_room_members (room_id, principal_id) VALUES (?, ?) \
						ON CONFLICT(room_id, principal_id) DO NOTHING",
					)
					.bind(room_id)
					.bind(p.get())
					.execute(&mut *tx)
					.await?;
				}
				tx.commit().await?;
				row
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				let name = match clean_name(name) {
					Some(n) => n,
					None => {
						let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chat_rooms")
							.fetch_one(&mut *tx)
							.await?;
						default_group_name(count as usize)
					}
				};
				let row: RoomRow = sqlx::query_as(
					"INSERT INTO chat_rooms (name, private_key, organization_id, created_at) VALUES ($1, NULL, $2, $3) \
					RETURNING id, name, private_key, organization_id",
				)
				.bind(name)
				.bind(org)
				.bind(now)
				.fetch_one(&mut *tx)
				.await?;
				let room_id = row.0;
				for p in members {
					sqlx::query(
						"INSERT INTO chat_room_members (room_id, principal_id) VALUES ($1, $2) \
						ON CONFLICT (room_id, principal_id) DO NOTHING",
					)
					.bind(room_id)
					.bind(p.get())
					.execute(&mut *tx)
					.await?;
				}
				tx.commit().await?;
				row
			}
		};

		room_from_row(row)
	}

	async fn rooms_for_member(&self, principal: PrincipalId) -> Result<Vec<RoomSummary>, StoreError> {
		let rows: Vec<(i64, Option<String>, Option<String>, Option<i64>, Option<i64>)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(ROOMS_FOR_MEMBER_SQLITE)
					.bind(principal.get())
					.fetch_all(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(ROOMS_FOR_MEMBER_POSTGRES)
					.bind(principal.get())
					.fetch_all(pool)
					.await?
			}
		};

		let mut out = Vec::with_capacity(rows.len());
		for (id, name, private_key, org, last_us) in rows {
			let room = room_from_row((id, name, private_key, org))?;
			let last = last_us.map(ts_from_micros).transpose()?;
			out.push(summarize(room, last, principal));
		}
		order_summaries(&mut out);
		Ok(out)
	}

	async fn ping(&self) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("SELECT 1").execute(pool).await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("SELECT 1").execute(pool).await?;
			}
		}
		Ok(())
	}
}
