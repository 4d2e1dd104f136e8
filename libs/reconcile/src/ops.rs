//! Seams between the operators, the subsystem, and the record store.

use async_trait::async_trait;
use serde::Serialize;

/// A public object: the stable, serialisable view of a subsystem resource.
pub trait Public: Serialize + Clone + Send + Sync + 'static {
    /// Key the subsystem knows the object by.
    fn key(&self) -> String;

    /// Copy server-assigned fields (ids, generated secrets) from the live object.
    ///
    /// Called before a generated object is compared with its live counterpart,
    /// so fields the generator cannot know do not count as drift.
    fn inherit(&mut self, _live: &Self) {}
}

/// Operations a subsystem offers for one kind of public object.
#[async_trait]
pub trait ObjectOps<T: Public>: Send + Sync {
    type Error: Send + 'static;

    /// Read the live object. `Ok(None)` when it does not exist.
    async fn read(&self, key: &str) -> Result<Option<T>, Self::Error>;

    async fn create(&self, public: &T) -> Result<T, Self::Error>;

    async fn update(&self, public: &T) -> Result<T, Self::Error>;

    async fn delete(&self, key: &str) -> Result<(), Self::Error>;

    /// Whether `err` means the object does not exist.
    fn is_not_found(err: &Self::Error) -> bool;
}

/// Persists the outcome of an operator into the owning record.
///
/// `None` removes the entry.
#[async_trait]
pub trait WriteBack<T: Public, E: Send + 'static>: Send + Sync {
    async fn write(&self, value: Option<&T>) -> Result<(), E>;
}

/// A write-back that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

#[async_trait]
impl<T: Public, E: Send + 'static> WriteBack<T, E> for Discard {
    async fn write(&self, _value: Option<&T>) -> Result<(), E> {
        Ok(())
    }
}

/// Wraps the operations of a shared object so that it is never deleted.
///
/// Used for objects whose name collides with a shared system resource.
pub struct Retained<'a, O>(pub &'a O);

#[async_trait]
impl<T, O> ObjectOps<T> for Retained<'_, O>
where
    T: Public,
    O: ObjectOps<T>,
{
    type Error = O::Error;

    async fn read(&self, key: &str) -> Result<Option<T>, Self::Error> {
        self.0.read(key).await
    }

    async fn create(&self, public: &T) -> Result<T, Self::Error> {
        self.0.create(public).await
    }

    async fn update(&self, public: &T) -> Result<T, Self::Error> {
        self.0.update(public).await
    }

    async fn delete(&self, _key: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn is_not_found(err: &Self::Error) -> bool {
        O::is_not_found(err)
    }
}
