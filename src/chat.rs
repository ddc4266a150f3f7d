//! Room/chat state (C7): login, room lifecycle, membership, message append/history.
//!
//! Grounded on the teacher's manager-over-shared-state shape (`PeerManager` owning a
//! `HashMap` behind a lock, `tracing::info!` on mutating operations), but the room/member/
//! message entities themselves have no teacher counterpart and are built fresh on top of the
//! repository (C2). Broadcast fan-out is a generalization of `PeerManager::connected_peers()`:
//! "all connected peers" becomes "all room members with an active session."

use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;

use crate::error::ChatError;
use crate::repo::{Member, Message, Repository, Room, User};

/// Display name for the server-owned AI author, auto-joined to a room on first `AI_MESSAGE`.
pub const AI_USER_EMAIL: &str = "ai@chat.local";
pub const AI_USER_DISPLAY_NAME: &str = "AI";

/// Outcome of a `LOGIN` attempt, mapped 1:1 onto the router's `WELCOME`/`PLEASE_LOGIN`/
/// `UNAUTHORISED` replies.
pub enum LoginOutcome {
    Welcome(User),
    PleaseLogin { email: String },
    Unauthorised,
}

/// Room/user/message business logic. Holds only a repository handle — it has no notion of
/// sessions or the network; the router (C6) is what binds this to a specific session.
pub struct ChatService {
    repo: Arc<Repository>,
}

impl ChatService {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// `LOGIN{email}` or `LOGIN{email,password}`, per spec §4.6.
    pub fn login(&self, email: &str, password: Option<&str>) -> Result<LoginOutcome, ChatError> {
        let existing = self.repo.find_user_by_email(email)?;

        match existing {
            Some(user) if user.password_hash.is_some() => {
                let Some(password) = password else {
                    return Ok(LoginOutcome::PleaseLogin {
                        email: user.email.clone(),
                    });
                };
                let hash = user.password_hash.as_deref().unwrap();
                if verify_password(password, hash) {
                    Ok(LoginOutcome::Welcome(user))
                } else {
                    Ok(LoginOutcome::Unauthorised)
                }
            }
            Some(user) => Ok(LoginOutcome::Welcome(user)),
            None => {
                let password_hash = password.map(hash_password).transpose()?;
                let user = self.repo.create_user(
                    &new_public_id(),
                    email,
                    None,
                    password_hash.as_deref(),
                )?;
                tracing::info!(user_id = %user.user_id, email = %user.email, "user created on first login");
                Ok(LoginOutcome::Welcome(user))
            }
        }
    }

    pub fn find_user(&self, user_id: i64) -> Result<Option<User>, ChatError> {
        self.repo.find_user_by_id(user_id)
    }

    pub fn list_rooms(&self) -> Result<Vec<Room>, ChatError> {
        self.repo.list_rooms()
    }

    /// Create a room and join the creator as its admin; `name` must be unique.
    pub fn create_room(&self, name: &str, is_private: bool, creator_id: i64) -> Result<Room, ChatError> {
        let room_id = new_public_id();
        let room = self.repo.create_room(&room_id, name, is_private, creator_id)?;
        tracing::info!(room_id = %room.room_id, name = %room.name, "room created");
        Ok(room)
    }

    pub fn find_room(&self, room_id: &str) -> Result<Room, ChatError> {
        self.repo
            .find_room_by_room_id(room_id)?
            .ok_or_else(|| ChatError::NotFound(format!("no such room: {room_id}")))
    }

    /// Idempotent join: re-joining a room one is already in is a no-op.
    pub fn join_room(&self, room: &Room, user_id: i64) -> Result<(), ChatError> {
        self.repo.join_room(room.id, user_id, false)
    }

    pub fn is_member(&self, room: &Room, user_id: i64) -> Result<bool, ChatError> {
        self.repo.is_member(room.id, user_id)
    }

    /// Leave a room. Returns `true` if the user was actually a member (admin transfer, if any,
    /// is handled by the repository inside one transaction).
    pub fn leave_room(&self, room: &Room, user_id: i64) -> Result<bool, ChatError> {
        self.repo.leave_room(room.id, user_id)
    }

    pub fn list_members(&self, room: &Room) -> Result<Vec<Member>, ChatError> {
        self.repo.list_members(room.id)
    }

    /// Append a message, total-ordered by `(created_at, id)` ascending on read.
    pub fn append_message(
        &self,
        room: &Room,
        user_id: i64,
        content: &str,
        is_announcement: bool,
    ) -> Result<Message, ChatError> {
        self.repo.append_message(room.id, user_id, content, is_announcement)
    }

    pub fn list_messages(&self, room: &Room, limit: i64) -> Result<Vec<Message>, ChatError> {
        self.repo.list_messages(room.id, limit)
    }

    pub fn recent_messages(&self, room: &Room, n: i64) -> Result<Vec<Message>, ChatError> {
        self.repo.recent_messages(room.id, n)
    }

    /// Find (or create and auto-join) the designated AI author for `room`, per spec §4.7.
    pub fn ensure_ai_user(&self, room: &Room) -> Result<User, ChatError> {
        let user = match self.repo.find_user_by_email(AI_USER_EMAIL)? {
            Some(user) => user,
            None => self
                .repo
                .create_user(&new_public_id(), AI_USER_EMAIL, Some(AI_USER_DISPLAY_NAME), None)?,
        };
        self.repo.join_room(room.id, user.id, false)?;
        Ok(user)
    }
}

fn new_public_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn hash_password(password: &str) -> Result<String, ChatError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ChatError::Fatal(format!("password hashing failed: {e}")))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ChatService {
        ChatService::new(Arc::new(Repository::open_in_memory().unwrap()))
    }

    #[test]
    fn test_login_new_passwordless_user_gets_welcome() {
        let svc = service();
        match svc.login("a@x.com", None).unwrap() {
            LoginOutcome::Welcome(user) => assert_eq!(user.email, "a@x.com"),
            _ => panic!("expected welcome"),
        }
    }

    #[test]
    fn test_login_existing_password_account_without_password_asks_for_it() {
        let svc = service();
        let hash = hash_password("s3cret").unwrap();
        svc.repo.create_user("u1", "b@x.com", None, Some(&hash)).unwrap();

        match svc.login("b@x.com", None).unwrap() {
            LoginOutcome::PleaseLogin { email } => assert_eq!(email, "b@x.com"),
            _ => panic!("expected please_login"),
        }

        match svc.login("b@x.com", Some("wrong")).unwrap() {
            LoginOutcome::Unauthorised => {}
            _ => panic!("expected unauthorised"),
        }

        match svc.login("b@x.com", Some("s3cret")).unwrap() {
            LoginOutcome::Welcome(user) => assert_eq!(user.email, "b@x.com"),
            _ => panic!("expected welcome"),
        }
    }

    #[test]
    fn test_create_room_join_leave() {
        let svc = service();
        let creator = match svc.login("c@x.com", None).unwrap() {
            LoginOutcome::Welcome(u) => u,
            _ => unreachable!(),
        };
        let room = svc.create_room("general", false, creator.id).unwrap();
        assert!(svc.is_member(&room, creator.id).unwrap());

        let joiner = match svc.login("j@x.com", None).unwrap() {
            LoginOutcome::Welcome(u) => u,
            _ => unreachable!(),
        };
        svc.join_room(&room, joiner.id).unwrap();
        svc.join_room(&room, joiner.id).unwrap(); // idempotent
        assert_eq!(svc.list_members(&room).unwrap().len(), 2);

        assert!(svc.leave_room(&room, joiner.id).unwrap());
        assert_eq!(svc.list_members(&room).unwrap().len(), 1);
    }

    #[test]
    fn test_ensure_ai_user_is_idempotent() {
        let svc = service();
        let creator = match svc.login("c@x.com", None).unwrap() {
            LoginOutcome::Welcome(u) => u,
            _ => unreachable!(),
        };
        let room = svc.create_room("general", false, creator.id).unwrap();

        let ai1 = svc.ensure_ai_user(&room).unwrap();
        let ai2 = svc.ensure_ai_user(&room).unwrap();
        assert_eq!(ai1.id, ai2.id);
        assert_eq!(svc.list_members(&room).unwrap().len(), 2);
    }

    #[test]
    fn test_message_append_and_history_order() {
        let svc = service();
        let user = match svc.login("a@x.com", None).unwrap() {
            LoginOutcome::Welcome(u) => u,
            _ => unreachable!(),
        };
        let room = svc.create_room("general", false, user.id).unwrap();
        svc.append_message(&room, user.id, "hi", false).unwrap();
        svc.append_message(&room, user.id, "there", false).unwrap();

        let history = svc.list_messages(&room, 100).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].content, "there");
    }
}
