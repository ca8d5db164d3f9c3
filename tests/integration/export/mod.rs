//! Export jobs: filters, archive contents and disk images.

#[cfg(test)]
mod tests {
    use crate::integration::common::*;
    use container_forensics::config::Config;
    use container_forensics::export::{ExportJob, ExportKind, ExportKinds, Targets};
    use container_forensics::{LabelFilter, Task};
    use flate2::read::GzDecoder;
    use std::fs::{self, File};
    use std::path::Path;
    use tar_rs as tar;
    use tempfile::tempdir;

    fn node(fs_root: &Path) -> ContainerdFixture {
        let mut containerd = ContainerdFixture::create(fs_root);
        let base = containerd.add_snapshot("k8s.io", "base", "", 1);
        write_file(&base.join("etc/os-release"), "ID=debian\n");
        write_file(&base.join("etc/motd"), "hello\n");
        let web = containerd.add_snapshot("k8s.io", "web-rw", "base", 2);
        write_file(&web.join("etc/.wh.motd"), "");
        write_file(&web.join("var/log/app.log"), "GET /admin\n");
        containerd.add_container(
            "k8s.io",
            "web",
            "web-rw",
            &[("io.kubernetes.pod.namespace", "shop"), ("app", "web")],
        );
        containerd.add_snapshot("k8s.io", "api-rw", "base", 3);
        containerd.add_container(
            "k8s.io",
            "api",
            "api-rw",
            &[("io.kubernetes.pod.namespace", "shop"), ("app", "api")],
        );
        containerd.add_snapshot("k8s.io", "proxy-rw", "base", 4);
        containerd.add_container(
            "k8s.io",
            "kube-proxy",
            "proxy-rw",
            &[("io.kubernetes.pod.namespace", "kube-system")],
        );
        containerd
    }

    fn archive_entries(path: &Path) -> Vec<(String, u64)> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
                (name, entry.header().mtime().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_archive_export_skips_kube_system() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let out = tempdir().unwrap();
        let containerd = node(fs_root.path());

        let disk = disk_image(images.path(), "node.img");
        let mounter = DirMounter::new().with_root("node.img", fs_root.path());
        let config = Config::default();
        let explorer = containerd.explorer();
        let task = Task::new(&config, &mounter, &explorer);

        let job = ExportJob::new(out.path(), ExportKinds::new(true, false), &config);
        let result = task.run_export(&[disk], &job).unwrap();

        assert!(result.failures.is_empty(), "{:?}", result.failures);
        assert_eq!(result.skipped, vec!["kube-proxy".to_string()]);
        let exported: Vec<&str> = result.items.iter().map(|a| a.container_id.as_str()).collect();
        assert_eq!(exported, vec!["api", "web"]);
        assert!(result.items.iter().all(|a| a.kind == ExportKind::Archive));
        let node_dir = out.path().join("node.img/containerd/k8s.io");
        assert!(!node_dir.join("kube-proxy.tar.gz").exists());

        let web = &result.items[1];
        assert_eq!(web.path, node_dir.join("web.tar.gz"));
        assert_eq!(web.size, fs::metadata(&web.path).unwrap().len());

        let started = job.started_at.timestamp() as u64;
        let entries = archive_entries(&web.path);
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["etc", "etc/os-release", "var", "var/log", "var/log/app.log"]
        );
        assert!(entries.iter().all(|(_, mtime)| *mtime == started));
    }

    #[test]
    fn test_label_filter_and_targets() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let out = tempdir().unwrap();
        let containerd = node(fs_root.path());

        let disk = disk_image(images.path(), "node.img");
        let mounter = DirMounter::new().with_root("node.img", fs_root.path());
        let config = Config::default();
        let explorer = containerd.explorer();
        let task = Task::new(&config, &mounter, &explorer);

        let job = ExportJob::new(out.path(), ExportKinds::new(true, false), &config)
            .with_label_filter(LabelFilter::parse("app=api").unwrap());
        let result = task.run_export(&[disk.clone()], &job).unwrap();
        let exported: Vec<&str> = result.items.iter().map(|a| a.container_id.as_str()).collect();
        assert_eq!(exported, vec!["api"]);
        assert_eq!(result.skipped.len(), 2);

        // An explicit target is still subject to namespace exclusion unless the
        // exclusion list is cleared.
        let job = ExportJob::new(out.path(), ExportKinds::new(true, false), &config)
            .with_targets(Targets::Ids(vec!["kube-proxy".to_string()]));
        let result = task.run_export(&[disk.clone()], &job).unwrap();
        assert!(result.items.is_empty());
        assert_eq!(result.skipped, vec!["kube-proxy".to_string()]);

        let job = job.with_excluded_namespaces(Vec::new());
        let result = task.run_export(&[disk], &job).unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].container_id, "kube-proxy");
    }

    #[test]
    fn test_archive_is_reproducible_within_a_job() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let containerd = node(fs_root.path());

        let disk = disk_image(images.path(), "node.img");
        let mounter = DirMounter::new().with_root("node.img", fs_root.path());
        let config = Config::default();
        let explorer = containerd.explorer();
        let task = Task::new(&config, &mounter, &explorer).with_container_ids(vec!["web".into()]);

        let job = ExportJob::new(first.path(), ExportKinds::new(true, false), &config);
        let a = task.run_export(&[disk.clone()], &job).unwrap();
        let mut again = job.clone();
        again.destination = second.path().to_path_buf();
        let b = task.run_export(&[disk], &again).unwrap();

        assert_eq!(a.items.len(), 1);
        assert_eq!(a.items[0].sha256, b.items[0].sha256);
    }

    #[test]
    fn test_same_id_on_two_disks_keeps_both_archives() {
        const ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let first_root = tempdir().unwrap();
        let second_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let out = tempdir().unwrap();

        for (root, content) in [(&first_root, "first"), (&second_root, "second")] {
            let docker = DockerFixture::create(root.path());
            docker.add_layer("aaaa", None, "cache-base");
            let rw = docker.add_container(ID, "aaaa", &[]);
            write_file(&rw.join("evidence.txt"), content);
        }

        let disks = vec![
            disk_image(images.path(), "a.raw"),
            disk_image(images.path(), "b.raw"),
        ];
        let mounter = DirMounter::new()
            .with_root("a.raw", first_root.path())
            .with_root("b.raw", second_root.path());
        let config = Config::default();
        let explorer = FixtureExplorer::default();
        let task = Task::new(&config, &mounter, &explorer);

        let job = ExportJob::new(out.path(), ExportKinds::new(true, false), &config);
        let result = task.run_export(&disks, &job).unwrap();
        assert!(result.failures.is_empty(), "{:?}", result.failures);
        assert_eq!(result.items.len(), 2);

        let paths: Vec<_> = result.items.iter().map(|a| a.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                out.path().join(format!("a.raw/docker/moby/{ID}.tar.gz")),
                out.path().join(format!("b.raw/docker/moby/{ID}.tar.gz")),
            ]
        );
        // Each reported digest still describes the file at its path.
        for artifact in &result.items {
            assert_eq!(
                container_forensics::digest::sha256_file(&artifact.path).unwrap(),
                artifact.sha256
            );
        }
        assert_ne!(result.items[0].sha256, result.items[1].sha256);
    }

    #[cfg(feature = "privileged-tests")]
    #[test]
    fn test_disk_image_round_trip() {
        use container_forensics::disk::{self, DiskImage, SystemMounter};

        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let out = tempdir().unwrap();
        let containerd = node(fs_root.path());

        let disk_path = disk_image(images.path(), "node.img");
        let mounter = DirMounter::new().with_root("node.img", fs_root.path());
        let config = Config::default();
        let explorer = containerd.explorer();
        let task = Task::new(&config, &mounter, &explorer).with_container_ids(vec!["web".into()]);

        let job = ExportJob::new(out.path(), ExportKinds::default(), &config);
        let result = task.run_export(&[disk_path], &job).unwrap();
        assert_eq!(result.items.len(), 1);
        let artifact = &result.items[0];
        assert_eq!(artifact.kind, ExportKind::DiskImage);
        assert_eq!(artifact.size % (1024 * 1024), 0);

        let image = DiskImage::open(&artifact.path).unwrap();
        let system = SystemMounter::new(&config);
        let mut handle = disk::mount(&image, &system).unwrap();
        let root = handle.mountpoints()[0].clone();
        assert_eq!(
            fs::read_to_string(root.join("var/log/app.log")).unwrap(),
            "GET /admin\n"
        );
        assert!(!root.join("etc/motd").exists());
        handle.unmount().unwrap();
    }
}
