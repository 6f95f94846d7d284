use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::activity::UserActivity;
use crate::config::BinsyncConfig;
use crate::error::{Error, Result};
use crate::state::State;
use crate::storage::{CommitId, GitTreeStore};

/// Access to every user's state in one repository, on behalf of one master
/// user whose state is kept open for editing.
#[derive(Debug)]
pub struct Client {
    repo_path: PathBuf,
    master_user: String,
    author_email: Option<String>,
    state: State,
}

impl Client {
    /// Open the repository at `repo_path`, creating it if needed, and load
    /// `master_user`'s state (empty when the user has no branch yet).
    pub fn new(repo_path: impl AsRef<Path>, master_user: &str) -> Result<Self> {
        Self::with_author_email(repo_path.as_ref(), master_user, None)
    }

    pub fn open(config: &BinsyncConfig) -> Result<Self> {
        Self::with_author_email(&config.repo_path, &config.user, config.author_email.clone())
    }

    fn with_author_email(repo_path: &Path, master_user: &str, author_email: Option<String>) -> Result<Self> {
        GitTreeStore::init(repo_path)?;
        let mut client = Self {
            repo_path: repo_path.to_path_buf(),
            master_user: master_user.to_string(),
            author_email,
            state: State::new(master_user),
        };
        client.state = client.get_state(master_user)?;
        Ok(client)
    }

    pub fn master_user(&self) -> &str {
        &self.master_user
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The master user's state.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    /// Every user with a state branch, master user included once it has
    /// saved.
    pub fn users(&self) -> Result<Vec<String>> {
        GitTreeStore::users(&self.repo_path)
    }

    fn store(&self, user: &str) -> Result<GitTreeStore> {
        let store = GitTreeStore::open(&self.repo_path, user)?;
        Ok(match &self.author_email {
            Some(email) => store.with_author_email(email),
            None => store,
        })
    }

    /// Load `user`'s latest state. The master user's state is bound to its
    /// branch and comes back empty when there is none yet; any other user
    /// without a branch is `NotFound`.
    pub fn get_state(&self, user: &str) -> Result<State> {
        let store = self.store(user)?;
        let is_master = user == self.master_user;

        let mut state = if store.exists()? {
            State::parse(&store, None)?
        } else if is_master {
            tracing::debug!("no state branch for {} yet, starting empty", user);
            State::new(user)
        } else {
            return Err(Error::not_found(format!("state of user `{user}`")));
        };

        if is_master {
            state.bind(Rc::new(store));
        }
        Ok(state)
    }

    /// Replace the master state's artifacts with `from_user`'s. The result
    /// is not saved. Returns whether anything changed.
    pub fn sync_states(&mut self, from_user: &str) -> Result<bool> {
        if from_user == self.master_user {
            return Ok(false);
        }
        let other = self.get_state(from_user)?;
        let changed = self.state.copy_state(&other);
        tracing::info!(
            "imported state of {} into {} (changed: {})",
            from_user,
            self.master_user,
            changed
        );
        Ok(changed)
    }

    /// Commit the master state if it has unsaved changes.
    pub fn save(&mut self) -> Result<Option<CommitId>> {
        if !self.state.dirty() {
            return Ok(None);
        }
        self.state.save().map(Some)
    }

    /// Latest activity of every user, skipping states that fail to load.
    pub fn activity(&self) -> Result<Vec<UserActivity>> {
        let mut activity = Vec::new();
        for user in self.users()? {
            match self.get_state(&user) {
                Ok(state) => activity.push(UserActivity::of(&state)),
                Err(e) => tracing::warn!("skipping activity of {}: {}", user, e),
            }
        }
        Ok(activity)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::data::{Comment, FunctionHeader, Struct};
    use crate::state::Stamp;

    #[test]
    fn test_master_starts_empty_and_bound() -> Result<()> {
        let temp = TempDir::new()?;
        let client = Client::new(temp.path(), "alice")?;
        assert!(client.state().is_bound());
        assert!(client.state().functions().is_empty());
        assert!(client.users()?.is_empty());
        assert!(matches!(client.get_state("bob"), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let temp = TempDir::new()?;
        let mut client = Client::new(temp.path(), "alice")?;
        assert_eq!(client.save()?, None);

        client
            .state_mut()
            .set_function_header(FunctionHeader::new(Some("main".into()), 0x1000), Stamp::Now);
        assert!(client.save()?.is_some());
        assert_eq!(client.save()?, None);

        let reopened = Client::new(temp.path(), "alice")?;
        assert_eq!(reopened.state().version, 1);
        assert_eq!(reopened.state().get_function(0x1000)?.name(), Some("main"));
        assert_eq!(reopened.users()?, vec!["alice"]);
        Ok(())
    }

    #[test]
    fn test_sync_states_copies_without_saving() -> Result<()> {
        let temp = TempDir::new()?;
        let mut bob = Client::new(temp.path(), "bob")?;
        bob.state_mut()
            .set_comment(Comment::new(0x20, "from bob"), Stamp::Now);
        bob.state_mut()
            .set_struct(Some(Struct::new("packet", 32)), None, Stamp::Now);
        bob.save()?;

        let mut alice = Client::new(temp.path(), "alice")?;
        assert!(alice.sync_states("bob")?);
        assert!(!alice.sync_states("bob")?);
        assert!(!alice.sync_states("alice")?);
        assert_eq!(alice.state().get_comment(0x20)?.comment, "from bob");
        assert!(alice.state().dirty());
        // Nothing reached alice's branch yet.
        assert_eq!(alice.users()?, vec!["bob"]);

        alice.save()?;
        assert_eq!(alice.users()?, vec!["alice", "bob"]);
        assert_eq!(alice.activity()?.len(), 2);
        Ok(())
    }
}
