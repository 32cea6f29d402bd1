/// Identity of the database this client talks to.
///
/// Immutable for the lifetime of the process; shared by the datastore and
/// every stream it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub project_id: String,
    pub database_id: String,
    /// Key used by the embedding SDK to namespace on-device state. The
    /// streaming core never reads it, but it travels with the identity.
    pub persistence_key: String,
    pub host: String,
    pub ssl_enabled: bool,
}

impl DatabaseInfo {
    pub fn new(
        project_id: impl Into<String>,
        database_id: impl Into<String>,
        persistence_key: impl Into<String>,
        host: impl Into<String>,
        ssl_enabled: bool,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: database_id.into(),
            persistence_key: persistence_key.into(),
            host: host.into(),
            ssl_enabled,
        }
    }

    /// `projects/<project>/databases/<database>`, as sent in the
    /// `google-cloud-resource-prefix` header and in write handshakes.
    pub fn resource_prefix(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.project_id, self.database_id
        )
    }
}
