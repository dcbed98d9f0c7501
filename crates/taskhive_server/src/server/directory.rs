#![forbid(unsafe_code)]

use std::sync::Arc;

use taskhive_domain::{OrganizationId, PrincipalId, Room, RoomId, RoomSummary};
use tracing::info;

use crate::server::store::{ChatStore, StoreError};

/// Explicit room actions that happen outside a chat connection.
#[derive(Clone)]
pub struct RoomDirectory {
	store: Arc<dyn ChatStore>,
}

impl RoomDirectory {
	pub fn new(store: Arc<dyn ChatStore>) -> Self {
		Self { store }
	}

	/// Create a group room. A blank name becomes `Group N`.
	pub async fn create_group(
		&self,
		name: Option<&str>,
		organization: Option<OrganizationId>,
		members: &[PrincipalId],
	) -> Result<Room, StoreError> {
		let room = self.store.create_group_room(name, organization, members).await?;
		info!(room = %room.id, name = %room.display_name(), members = members.len(), "group room created");
		Ok(room)
	}

	/// Add members to an existing group room.
	pub async fn add_members(&self, room: RoomId, members: &[PrincipalId]) -> Result<Vec<PrincipalId>, StoreError> {
		self.store.add_members(room, members).await?;
		self.store.members(room).await
	}

	/// The principal's rooms, most recently active first.
	pub async fn rooms_for(&self, principal: PrincipalId) -> Result<Vec<RoomSummary>, StoreError> {
		self.store.rooms_for_member(principal).await
	}
}
