use crate::error::PathError;

/// A dotted procedure path split into its executor namespace and the
/// procedure name inside that namespace.
///
/// `DO_COUNTER.inc` parses to namespace `DO_COUNTER`, procedure `inc`. Only the
/// first separator splits, so nested routers keep their dots in the
/// procedure part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedurePath {
    namespace: String,
    procedure: String,
}

impl ProcedurePath {
    pub const SEPARATOR: char = '.';

    pub fn parse(path: &str) -> Result<Self, PathError> {
        let path = path.strip_prefix('/').unwrap_or(path);

        let (namespace, procedure) = path
            .split_once(Self::SEPARATOR)
            .ok_or_else(|| PathError::Invalid(format!("'{path}' has no namespace separator")))?;

        if namespace.is_empty() || procedure.is_empty() {
            return Err(PathError::Invalid(format!(
                "'{path}' has an empty namespace or procedure"
            )));
        }

        Ok(ProcedurePath {
            namespace: namespace.to_owned(),
            procedure: procedure.to_owned(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn full_path(&self) -> String {
        format!("{}{}{}", self.namespace, Self::SEPARATOR, self.procedure)
    }
}
