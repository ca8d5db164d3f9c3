//! Docker overlay2 discovery and drift through a full task.

#[cfg(test)]
mod tests {
    use crate::integration::common::*;
    use container_forensics::config::Config;
    use container_forensics::drift::DriftKind;
    use container_forensics::{RuntimeKind, Task};
    use std::path::Path;
    use tempfile::tempdir;

    const WEB_ID: &str = "c0ffee00aa11bb22cc33dd44ee55ff66778899aabbccddeeff00112233445566";
    const DB_ID: &str = "dbdbdbdb00112233445566778899aabbccddeeff00112233445566778899aabb";

    /// Two-layer nginx image with a web container on top. Returns the
    /// container's writable directory.
    fn nginx_host(fs_root: &Path) -> (DockerFixture, std::path::PathBuf) {
        let docker = DockerFixture::create(fs_root);
        let base = docker.add_layer("aaaa", None, "cache-base");
        write_file(&base.join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n");
        write_file(&base.join("etc/motd"), "welcome\n");
        write_file(&base.join("usr/bin/curl"), "ELF");
        let app = docker.add_layer("bbbb", Some("aaaa"), "cache-app");
        write_file(&app.join("etc/nginx/nginx.conf"), "events {}\n");

        docker.add_image_config(
            NGINX_IMAGE_ID,
            &[("maintainer", "NGINX Docker Maintainers"), ("tier", "image")],
        );
        let rw = docker.add_container(WEB_ID, "bbbb", &[("tier", "frontend"), ("app", "web")]);
        (docker, rw)
    }

    #[test]
    fn test_list_reads_docker_metadata() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        nginx_host(fs_root.path());

        let disk = disk_image(images.path(), "host.raw");
        let mounter = DirMounter::new().with_root("host.raw", fs_root.path());
        let config = Config::default();
        let explorer = FixtureExplorer::default();
        let task = Task::new(&config, &mounter, &explorer);

        let result = task.run_list(&[disk]).unwrap();
        assert!(result.failures.is_empty(), "{:?}", result.failures);
        assert_eq!(result.items.len(), 1);

        let record = &result.items[0];
        assert_eq!(record.id(), WEB_ID);
        assert_eq!(record.runtime(), RuntimeKind::Docker);
        assert_eq!(record.namespace(), "moby");
        assert_eq!(record.source_disk(), "host.raw");
        assert_eq!(record.hostname(), Some(&WEB_ID[..12]));
        assert_eq!(record.image(), Some("nginx:1.25"));
        assert_eq!(record.created().unwrap().timestamp(), 1709287200);
        assert_eq!(record.updated().unwrap().timestamp(), 1709287201);

        // Container labels override image labels.
        assert_eq!(record.labels().get("tier").map(String::as_str), Some("frontend"));
        assert_eq!(
            record.labels().get("maintainer").map(String::as_str),
            Some("NGINX Docker Maintainers")
        );

        // base, app, init, writable
        assert_eq!(record.layers().len(), 4);
        assert_eq!(record.layers()[0].id, "sha256:aaaa");
        assert_eq!(mounter.attached.get(), mounter.detached.get());
    }

    #[test]
    fn test_drift_whiteouts_and_changes() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let (_, rw) = nginx_host(fs_root.path());
        write_file(&rw.join("etc/.wh.motd"), "");
        write_file(&rw.join("usr/bin/.wh.curl"), "");
        write_file(
            &rw.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nbackdoor:x:0:0::/:/bin/sh\n",
        );
        write_file(&rw.join("etc/nginx/nginx.conf"), "events {}\n");
        write_file(&rw.join("tmp/.x/miner"), "xmrig");

        let disk = disk_image(images.path(), "host.raw");
        let mounter = DirMounter::new().with_root("host.raw", fs_root.path());
        let config = Config::default();
        let explorer = FixtureExplorer::default();
        let task = Task::new(&config, &mounter, &explorer);

        let result = task.run_drift(&[disk.clone()]).unwrap();
        assert_eq!(result.items.len(), 1);
        let report = &result.items[0];
        let entries: Vec<(&str, DriftKind)> = report
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e.kind))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("/etc/motd", DriftKind::Deleted),
                ("/etc/passwd", DriftKind::Modified),
                ("/tmp/.x/miner", DriftKind::Added),
                ("/usr/bin/curl", DriftKind::Deleted),
            ]
        );
        let summary = report.summary();
        assert_eq!((summary.added, summary.modified, summary.deleted), (1, 1, 2));

        // Same inputs, same report.
        let again = task.run_drift(&[disk]).unwrap();
        assert_eq!(again.items[0].entries, report.entries);
    }

    #[test]
    fn test_container_id_prefix_selection() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let (docker, _) = nginx_host(fs_root.path());
        docker.add_container(DB_ID, "aaaa", &[("app", "db")]);

        let disk = disk_image(images.path(), "host.raw");
        let mounter = DirMounter::new().with_root("host.raw", fs_root.path());
        let config = Config::default();
        let explorer = FixtureExplorer::default();

        let all = Task::new(&config, &mounter, &explorer)
            .run_list(&[disk.clone()])
            .unwrap();
        let ids: Vec<&str> = all.items.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![WEB_ID, DB_ID]);

        let selected = Task::new(&config, &mounter, &explorer)
            .with_container_ids(vec!["dbdb".to_string()])
            .run_list(&[disk])
            .unwrap();
        assert_eq!(selected.items.len(), 1);
        assert_eq!(selected.items[0].id(), DB_ID);
    }

    #[test]
    fn test_broken_layer_chain_is_a_container_failure() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let (docker, _) = nginx_host(fs_root.path());
        docker.add_container(DB_ID, "missing", &[]);

        let disk = disk_image(images.path(), "host.raw");
        let mounter = DirMounter::new().with_root("host.raw", fs_root.path());
        let config = Config::default();
        let explorer = FixtureExplorer::default();

        let result = Task::new(&config, &mounter, &explorer)
            .run_list(&[disk])
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].id(), WEB_ID);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].container_id.as_deref(), Some(DB_ID));
        assert_eq!(result.failures[0].kind, "discovery");
    }
}
