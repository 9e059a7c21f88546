//! Container image reference splitting.
//!
//! Image references follow the registry convention: the first path segment
//! names a registry host only if it contains a `.` or a `:` or is exactly
//! `localhost`; otherwise the whole reference is a repository on the
//! default registry. The digest (after `@`) has to be split off before the
//! tag, since digests themselves contain a `:`.

/// The parts of an image reference such as
/// `registry.example.com:5000/team/app:1.4@sha256:abcd…`.
///
/// `repo` keeps the registry prefix when one is present, matching how the
/// runtime reports repositories in `RepoDigests`/`RepoTags`; `hostname` and
/// `port` additionally expose the registry on its own.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageName {
    pub hostname: String,
    pub port: String,
    pub repo: String,
    pub tag: String,
    pub digest: String,
}

impl ImageName {
    /// Splits a raw image reference into its parts. Absent parts come back
    /// as empty strings.
    pub fn split(image: &str) -> Self {
        let (hostport, rest) = match image.split_once('/') {
            Some((first, rem))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first, rem)
            }
            _ => ("", image),
        };

        let (hostname, port) = match hostport.split_once(':') {
            Some((host, port)) => (host, port),
            None => (hostport, ""),
        };

        let (rest, digest) = match rest.split_once('@') {
            Some((rest, digest)) => (rest, digest),
            None => (rest, ""),
        };

        let (name, tag) = match rest.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (rest, ""),
        };

        let repo = if hostport.is_empty() {
            name.to_owned()
        } else {
            format!("{hostport}/{name}")
        };

        Self {
            hostname: hostname.to_owned(),
            port: port.to_owned(),
            repo,
            tag: tag.to_owned(),
            digest: digest.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_bare_repo() {
        let name = ImageName::split("nginx");
        assert_eq!(name.repo, "nginx");
        assert_eq!(name.tag, "");
        assert_eq!(name.digest, "");
        assert_eq!(name.hostname, "");
    }

    #[test]
    fn test_split_repo_and_tag() {
        let name = ImageName::split("library/nginx:1.25");
        assert_eq!(name.repo, "library/nginx");
        assert_eq!(name.tag, "1.25");
        assert_eq!(name.hostname, "");
    }

    #[test]
    fn test_split_registry_with_port() {
        let name = ImageName::split("registry.example.com:5000/team/app:1.4");
        assert_eq!(name.hostname, "registry.example.com");
        assert_eq!(name.port, "5000");
        assert_eq!(name.repo, "registry.example.com:5000/team/app");
        assert_eq!(name.tag, "1.4");
    }

    #[test]
    fn test_split_localhost_registry() {
        let name = ImageName::split("localhost/app");
        assert_eq!(name.hostname, "localhost");
        assert_eq!(name.port, "");
        assert_eq!(name.repo, "localhost/app");
    }

    #[test]
    fn test_plain_namespace_is_not_a_registry() {
        // "team" has no dot, colon and is not localhost
        let name = ImageName::split("team/app:2.0");
        assert_eq!(name.hostname, "");
        assert_eq!(name.repo, "team/app");
        assert_eq!(name.tag, "2.0");
    }

    #[test]
    fn test_digest_is_split_before_tag() {
        let name = ImageName::split("app@sha256:0123abcd");
        assert_eq!(name.repo, "app");
        assert_eq!(name.tag, "");
        assert_eq!(name.digest, "sha256:0123abcd");

        let name = ImageName::split("registry.io/app:1.0@sha256:0123abcd");
        assert_eq!(name.repo, "registry.io/app");
        assert_eq!(name.tag, "1.0");
        assert_eq!(name.digest, "sha256:0123abcd");
    }
}
