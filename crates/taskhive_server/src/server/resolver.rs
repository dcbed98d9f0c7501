#![forbid(unsafe_code)]

use std::sync::Arc;

use taskhive_domain::{OrganizationId, PrincipalId, PrivatePair, Room, RoomId};
use taskhive_protocol::Route;
use thiserror::Error;
use tracing::debug;

use crate::server::store::{ChatStore, StoreError};

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("room {0} not found")]
	NotFound(RoomId),

	#[error(transparent)]
	Persistence(#[from] StoreError),
}

/// Turns connection routing parameters into a persisted room.
#[derive(Clone)]
pub struct RoomResolver {
	store: Arc<dyn ChatStore>,
}

impl RoomResolver {
	pub fn new(store: Arc<dyn ChatStore>) -> Self {
		Self { store }
	}

	/// Get-or-create the pair's room and make sure both principals are members.
	///
	/// `organization` only applies when the room is created.
	pub async fn resolve_private(
		&self,
		a: PrincipalId,
		b: PrincipalId,
		organization: Option<OrganizationId>,
	) -> Result<Room, ResolveError> {
		let pair = PrivatePair::new(a, b);
		let room = self.store.get_or_create_private_room(pair, organization).await?;
		self.store.add_members(room.id, &pair.members()).await?;

		debug!(room = %room.id, key = %pair, "resolved private room");
		Ok(room)
	}

	/// Look up an existing room. Never creates one.
	pub async fn resolve_group(&self, id: RoomId) -> Result<Room, ResolveError> {
		match self.store.get_room(id).await? {
			Some(room) => Ok(room),
			None => Err(ResolveError::NotFound(id)),
		}
	}

	pub async fn resolve(&self, route: &Route, organization: Option<OrganizationId>) -> Result<Room, ResolveError> {
		match *route {
			Route::Private { a, b } => self.resolve_private(a, b, organization).await,
			Route::Group { room } => self.resolve_group(room).await,
		}
	}
}
