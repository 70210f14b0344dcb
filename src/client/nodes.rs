//! Node operations.
//!
//! Every operation has a blocking form that suspends the calling task until the reply
//! (or the request timeout) and a `_background` form that returns immediately and
//! hands the result to a callback on the completion-delivery task.

use bytes::Bytes;
use tracing::debug;

use super::into_children;
use super::into_created;
use super::into_data;
use super::into_deleted;
use super::into_exists;
use super::into_watch_added;
use super::into_written;
use super::Client;
use super::NodeData;
use super::Responder;
use super::WatchRegistration;
use crate::path::validate_path;
use crate::CreateMode;
use crate::OpResult;
use crate::Operation;
use crate::Result;
use crate::Stat;
use crate::WatchMode;

impl Client {
    /// Creates a persistent node and returns its path
    ///
    /// # Errors
    /// - [`crate::NodeError::NodeExists`] if the node exists
    /// - [`crate::NodeError::NoNode`] if the parent is missing and `create_parents` is false
    pub async fn create(
        &self,
        path: &str,
        payload: impl Into<Bytes>,
        create_parents: bool,
    ) -> Result<String> {
        self.create_with_mode(path, payload, CreateMode::Persistent, create_parents)
            .await
    }

    /// Creates a node with an explicit [`CreateMode`]; sequential modes return the
    /// suffixed path
    pub async fn create_with_mode(
        &self,
        path: &str,
        payload: impl Into<Bytes>,
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<String> {
        validate_path(path)?;
        let op = Operation::Create {
            path: path.to_string(),
            payload: payload.into(),
            mode,
            create_parents,
        };
        into_created(self.dispatch().call(op).await?)
    }

    /// Deletes a node; `delete_children` removes the whole subtree depth-first
    ///
    /// # Errors
    /// - [`crate::NodeError::NotEmpty`] if the node has children and `delete_children`
    ///   is false
    /// - [`crate::NodeError::NoNode`] if the node is absent
    pub async fn delete(
        &self,
        path: &str,
        delete_children: bool,
    ) -> Result<()> {
        validate_path(path)?;
        let op = Operation::Delete {
            path: path.to_string(),
            recursive: delete_children,
        };
        into_deleted(self.dispatch().call(op).await?)
    }

    pub async fn read(
        &self,
        path: &str,
    ) -> Result<NodeData> {
        validate_path(path)?;
        let op = Operation::Read {
            path: path.to_string(),
        };
        into_data(self.dispatch().call(op).await?)
    }

    /// Replaces the payload and returns the new version
    ///
    /// # Errors
    /// [`crate::NodeError::VersionConflict`] if `expected_version` is given and differs
    /// from the node's version.
    pub async fn write(
        &self,
        path: &str,
        payload: impl Into<Bytes>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        validate_path(path)?;
        let op = Operation::Write {
            path: path.to_string(),
            payload: payload.into(),
            expected_version,
        };
        into_written(self.dispatch().call(op).await?)
    }

    /// Child names, sorted
    pub async fn list_children(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        validate_path(path)?;
        let op = Operation::ListChildren {
            path: path.to_string(),
        };
        into_children(self.dispatch().call(op).await?)
    }

    pub async fn exists(
        &self,
        path: &str,
    ) -> Result<Option<Stat>> {
        validate_path(path)?;
        let op = Operation::Exists {
            path: path.to_string(),
        };
        into_exists(self.dispatch().call(op).await?)
    }

    /// Registers a watch on `path`
    ///
    /// The registration is active on the service once this returns; events for
    /// changes applied afterwards are delivered to it.
    pub async fn watch(
        &self,
        path: &str,
        mode: WatchMode,
    ) -> Result<WatchRegistration> {
        validate_path(path)?;
        let dispatch = self.dispatch();
        let (watch_id, events) = dispatch.watches.register(path, mode);
        let registration =
            WatchRegistration::new(watch_id, path.to_string(), mode, events, dispatch.clone());

        // the registration unregisters itself on drop if the service refused it
        let op = Operation::AddWatch {
            watch_id,
            path: path.to_string(),
            mode,
        };
        into_watch_added(dispatch.call(op).await?)?;
        debug!(watch_id, path, ?mode, "watch active");
        Ok(registration)
    }

    /// Reads a node after arming a one-shot watch on it
    pub async fn read_and_watch(
        &self,
        path: &str,
    ) -> Result<(NodeData, WatchRegistration)> {
        let registration = self.watch(path, WatchMode::OneShot).await?;
        let data = self.read(path).await?;
        Ok((data, registration))
    }

    pub fn create_background<F>(
        &self,
        path: &str,
        payload: impl Into<Bytes>,
        create_parents: bool,
        callback: F,
    ) where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        let op = Operation::Create {
            path: path.to_string(),
            payload: payload.into(),
            mode: CreateMode::Persistent,
            create_parents,
        };
        self.background(op, move |r| callback(r.and_then(into_created)));
    }

    pub fn delete_background<F>(
        &self,
        path: &str,
        delete_children: bool,
        callback: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let op = Operation::Delete {
            path: path.to_string(),
            recursive: delete_children,
        };
        self.background(op, move |r| callback(r.and_then(into_deleted)));
    }

    pub fn read_background<F>(
        &self,
        path: &str,
        callback: F,
    ) where
        F: FnOnce(Result<NodeData>) + Send + 'static,
    {
        let op = Operation::Read {
            path: path.to_string(),
        };
        self.background(op, move |r| callback(r.and_then(into_data)));
    }

    pub fn write_background<F>(
        &self,
        path: &str,
        payload: impl Into<Bytes>,
        expected_version: Option<u64>,
        callback: F,
    ) where
        F: FnOnce(Result<u64>) + Send + 'static,
    {
        let op = Operation::Write {
            path: path.to_string(),
            payload: payload.into(),
            expected_version,
        };
        self.background(op, move |r| callback(r.and_then(into_written)));
    }

    pub fn list_children_background<F>(
        &self,
        path: &str,
        callback: F,
    ) where
        F: FnOnce(Result<Vec<String>>) + Send + 'static,
    {
        let op = Operation::ListChildren {
            path: path.to_string(),
        };
        self.background(op, move |r| callback(r.and_then(into_children)));
    }

    /// Issues `op` in the background; its outcome is published to
    /// [`listen`](Client::listen) subscribers
    pub fn submit(
        &self,
        op: Operation,
    ) {
        self.dispatch().enqueue(op, Responder::Publish);
    }

    fn background<F>(
        &self,
        op: Operation,
        callback: F,
    ) where
        F: FnOnce(Result<OpResult>) + Send + 'static,
    {
        self.dispatch()
            .enqueue(op, Responder::Callback(Box::new(callback)));
    }
}
