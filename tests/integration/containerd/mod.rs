//! containerd discovery from Container Explorer metadata and overlayfs snapshots.

#[cfg(test)]
mod tests {
    use crate::integration::common::*;
    use container_forensics::config::Config;
    use container_forensics::drift::DriftKind;
    use container_forensics::{RuntimeKind, Task};
    use std::path::Path;
    use tempfile::tempdir;

    /// A kubelet node: one application pod container and one kube-system
    /// container sharing the same base snapshot.
    fn k8s_node(fs_root: &Path) -> ContainerdFixture {
        let mut containerd = ContainerdFixture::create(fs_root);
        let base = containerd.add_snapshot("k8s.io", "sha256:base", "", 1);
        write_file(&base.join("etc/os-release"), "ID=debian\n");
        write_file(&base.join("usr/local/bin/app"), "v1");

        let web = containerd.add_snapshot("k8s.io", "web-rw", "sha256:base", 2);
        write_file(&web.join("usr/local/bin/app"), "v1-patched");
        write_file(&web.join("root/.ssh/authorized_keys"), "ssh-ed25519 AAAA");
        containerd.add_container(
            "k8s.io",
            "web",
            "web-rw",
            &[("io.kubernetes.pod.namespace", "shop"), ("app", "web")],
        );

        containerd.add_snapshot("k8s.io", "dns-rw", "sha256:base", 3);
        containerd.add_container(
            "k8s.io",
            "coredns",
            "dns-rw",
            &[("io.kubernetes.pod.namespace", "kube-system")],
        );
        containerd
    }

    #[test]
    fn test_list_containerd_containers() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let containerd = k8s_node(fs_root.path());

        let disk = disk_image(images.path(), "node.qcow2");
        let mounter = DirMounter::new().with_root("node.qcow2", fs_root.path());
        let config = Config::default();
        let explorer = containerd.explorer();

        let result = Task::new(&config, &mounter, &explorer)
            .run_list(&[disk])
            .unwrap();
        assert!(result.failures.is_empty(), "{:?}", result.failures);
        let ids: Vec<&str> = result.items.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["coredns", "web"]);

        let web = &result.items[1];
        assert_eq!(web.runtime(), RuntimeKind::Containerd);
        assert_eq!(web.namespace(), "k8s.io");
        assert_eq!(web.hostname(), Some("web-host"));
        assert_eq!(web.layers().len(), 2);
        assert_eq!(web.layers()[0].id, "sha256:base");
        assert_eq!(web.storage_root(), containerd.root.as_path());
    }

    #[test]
    fn test_containerd_drift() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let containerd = k8s_node(fs_root.path());

        let disk = disk_image(images.path(), "node.qcow2");
        let mounter = DirMounter::new().with_root("node.qcow2", fs_root.path());
        let config = Config::default();
        let explorer = containerd.explorer();

        let result = Task::new(&config, &mounter, &explorer)
            .with_container_ids(vec!["web".to_string()])
            .run_drift(&[disk])
            .unwrap();
        assert_eq!(result.items.len(), 1);
        let entries: Vec<(&str, DriftKind)> = result.items[0]
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e.kind))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("/root/.ssh/authorized_keys", DriftKind::Added),
                ("/usr/local/bin/app", DriftKind::Modified),
            ]
        );
    }

    #[test]
    fn test_unreadable_metadata_is_reported() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let containerd = k8s_node(fs_root.path());

        // A container whose snapshot was never committed to the metadata store.
        let mut explorer = containerd.explorer();
        explorer.containers[0].snapshot_key = "gone".to_string();

        let disk = disk_image(images.path(), "node.qcow2");
        let mounter = DirMounter::new().with_root("node.qcow2", fs_root.path());
        let config = Config::default();

        let result = Task::new(&config, &mounter, &explorer)
            .run_list(&[disk])
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind, "discovery");
        assert!(result.failures[0].message.contains("gone"));
    }
}
