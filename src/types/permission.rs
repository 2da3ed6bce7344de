use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed permission vocabulary.
///
/// Names prefixed `admin.` are admin scope and are granted globally through a role;
/// everything else is user scope and is granted per server and stack pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "servers.read")]
    ServersRead,
    #[serde(rename = "stacks.read")]
    StacksRead,
    #[serde(rename = "stacks.manage")]
    StacksManage,
    #[serde(rename = "stacks.create")]
    StacksCreate,
    #[serde(rename = "stacks.delete")]
    StacksDelete,
    #[serde(rename = "files.read")]
    FilesRead,
    #[serde(rename = "files.write")]
    FilesWrite,
    #[serde(rename = "logs.read")]
    LogsRead,
    #[serde(rename = "registries.manage")]
    RegistriesManage,
    #[serde(rename = "admin.users.read")]
    AdminUsersRead,
    #[serde(rename = "admin.users.write")]
    AdminUsersWrite,
    #[serde(rename = "admin.roles.read")]
    AdminRolesRead,
    #[serde(rename = "admin.roles.write")]
    AdminRolesWrite,
    #[serde(rename = "admin.permissions.read")]
    AdminPermissionsRead,
    #[serde(rename = "admin.servers.read")]
    AdminServersRead,
    #[serde(rename = "admin.servers.write")]
    AdminServersWrite,
    #[serde(rename = "admin.logs.read")]
    AdminLogsRead,
    #[serde(rename = "admin.system.export")]
    AdminSystemExport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Admin,
    User,
}

impl Permission {
    pub const ALL: &'static [Permission] = &[
        Permission::ServersRead,
        Permission::StacksRead,
        Permission::StacksManage,
        Permission::StacksCreate,
        Permission::StacksDelete,
        Permission::FilesRead,
        Permission::FilesWrite,
        Permission::LogsRead,
        Permission::RegistriesManage,
        Permission::AdminUsersRead,
        Permission::AdminUsersWrite,
        Permission::AdminRolesRead,
        Permission::AdminRolesWrite,
        Permission::AdminPermissionsRead,
        Permission::AdminServersRead,
        Permission::AdminServersWrite,
        Permission::AdminLogsRead,
        Permission::AdminSystemExport,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Permission::ServersRead => "servers.read",
            Permission::StacksRead => "stacks.read",
            Permission::StacksManage => "stacks.manage",
            Permission::StacksCreate => "stacks.create",
            Permission::StacksDelete => "stacks.delete",
            Permission::FilesRead => "files.read",
            Permission::FilesWrite => "files.write",
            Permission::LogsRead => "logs.read",
            Permission::RegistriesManage => "registries.manage",
            Permission::AdminUsersRead => "admin.users.read",
            Permission::AdminUsersWrite => "admin.users.write",
            Permission::AdminRolesRead => "admin.roles.read",
            Permission::AdminRolesWrite => "admin.roles.write",
            Permission::AdminPermissionsRead => "admin.permissions.read",
            Permission::AdminServersRead => "admin.servers.read",
            Permission::AdminServersWrite => "admin.servers.write",
            Permission::AdminLogsRead => "admin.logs.read",
            Permission::AdminSystemExport => "admin.system.export",
        }
    }

    pub fn parse(s: &str) -> Option<Permission> {
        Self::ALL.iter().copied().find(|p| p.name() == s)
    }

    #[must_use]
    pub fn scope(self) -> PermissionScope {
        if self.name().starts_with("admin.") {
            PermissionScope::Admin
        } else {
            PermissionScope::User
        }
    }

    /// `stacks.manage` → `stacks`, `admin.users.write` → `admin.users`.
    #[must_use]
    pub fn resource(self) -> &'static str {
        let name = self.name();
        name.rsplit_once('.').map_or(name, |(resource, _)| resource)
    }

    #[must_use]
    pub fn action(self) -> &'static str {
        let name = self.name();
        name.rsplit_once('.').map_or(name, |(_, action)| action)
    }

    /// Key-only permissions are satisfied by an API key scope alone.
    /// None of the current vocabulary is key-only.
    #[must_use]
    pub const fn is_api_key_only(self) -> bool {
        false
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Permission::ServersRead => "View server details and statistics",
            Permission::StacksRead => "View stacks, compose files and container state",
            Permission::StacksManage => "Run compose operations and edit compose files",
            Permission::StacksCreate => "Create new stacks",
            Permission::StacksDelete => "Delete stacks",
            Permission::FilesRead => "Read files inside a stack directory",
            Permission::FilesWrite => "Upload, rename and delete stack files",
            Permission::LogsRead => "Read stack and container logs",
            Permission::RegistriesManage => "Manage registry credentials for a server",
            Permission::AdminUsersRead => "List and view users",
            Permission::AdminUsersWrite => "Create, update and delete users",
            Permission::AdminRolesRead => "List and view roles",
            Permission::AdminRolesWrite => "Create, update and delete roles and grants",
            Permission::AdminPermissionsRead => "List the permission vocabulary",
            Permission::AdminServersRead => "List and view servers",
            Permission::AdminServersWrite => "Create, update and delete servers",
            Permission::AdminLogsRead => "Read operation and security audit logs",
            Permission::AdminSystemExport => "Export an encrypted configuration bundle",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
