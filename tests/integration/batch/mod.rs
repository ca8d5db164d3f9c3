//! Multi-disk batches: per-image failures, mount balance and cancellation.

#[cfg(test)]
mod tests {
    use crate::integration::common::*;
    use container_forensics::config::Config;
    use container_forensics::disk::{Attachment, DiskImage, Mounter};
    use container_forensics::report::{self, TaskLog};
    use container_forensics::{CancelToken, ExportJob, ExportKinds, ForensicsError, Task};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const ID: &str = "feedfacefeedfacefeedfacefeedfacefeedfacefeedfacefeedfacefeedface";

    #[test]
    fn test_batch_continues_past_bad_images() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let docker = DockerFixture::create(fs_root.path());
        docker.add_layer("aaaa", None, "cache-base");
        docker.add_container(ID, "aaaa", &[]);

        let disks = vec![
            images.path().join("laptop.vmdk"),
            disk_image(images.path(), "broken.raw"),
            disk_image(images.path(), "server.dd"),
        ];
        // broken.raw has no prepared root, so attaching it fails.
        let mounter = DirMounter::new().with_root("server.dd", fs_root.path());
        let config = Config::default();
        let explorer = FixtureExplorer::default();
        let log_dir = tempdir().unwrap();
        let task = Task::new(&config, &mounter, &explorer)
            .with_log(TaskLog::new(log_dir.path().join("task.log")));

        let result = task.run_list(&disks).unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].source_disk(), "server.dd");

        let kinds: Vec<(&str, &str)> = result
            .failures
            .iter()
            .map(|f| (f.disk.as_str(), f.kind.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![("laptop.vmdk", "unsupported_format"), ("broken.raw", "mount")]
        );

        // The unsupported image is rejected before any attach is attempted.
        assert_eq!(
            *mounter.order.borrow(),
            vec!["broken.raw".to_string(), "server.dd".to_string()]
        );
        assert_eq!(mounter.attached.get(), 1);
        assert_eq!(mounter.detached.get(), 1);

        let log = fs::read_to_string(log_dir.path().join("task.log")).unwrap();
        assert!(log.contains("Done processing disk server.dd"));

        let markdown = report::listing_markdown(&result.items, &result.failures);
        assert!(markdown.contains("## Failures"));
        assert!(markdown.contains("| laptop.vmdk | - | unsupported_format |"));
    }

    #[test]
    fn test_no_usable_image() {
        let images = tempdir().unwrap();
        let disks: Vec<PathBuf> = vec![
            images.path().join("a.vhd"),
            disk_image(images.path(), "b.raw"),
        ];
        let mounter = DirMounter::new();
        let config = Config::default();
        let explorer = FixtureExplorer::default();

        let err = Task::new(&config, &mounter, &explorer)
            .run_drift(&disks)
            .unwrap_err();
        assert!(matches!(err, ForensicsError::NoUsableImage));
    }

    #[test]
    fn test_custom_root_path() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let docker = DockerFixture::create(&fs_root.path().join("data"));
        docker.add_layer("aaaa", None, "cache-base");
        docker.add_container(ID, "aaaa", &[]);

        let disk = disk_image(images.path(), "host.raw");
        let mounter = DirMounter::new().with_root("host.raw", fs_root.path());
        let config = Config::default();
        let explorer = FixtureExplorer::default();

        let err = Task::new(&config, &mounter, &explorer)
            .run_list(&[disk.clone()])
            .unwrap_err();
        assert!(matches!(err, ForensicsError::NoStorageLayout));

        let result = Task::new(&config, &mounter, &explorer)
            .with_custom_paths(vec![PathBuf::from("/data/var/lib/docker")])
            .run_list(&[disk])
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(mounter.attached.get(), mounter.detached.get());
    }

    /// Cancels the task as soon as a disk is attached.
    struct CancellingMounter {
        inner: DirMounter,
        cancel: CancelToken,
    }

    impl Mounter for CancellingMounter {
        fn attach(&self, image: &DiskImage) -> anyhow::Result<Attachment> {
            let attachment = self.inner.attach(image)?;
            self.cancel.cancel();
            Ok(attachment)
        }

        fn detach(&self, attachment: &Attachment) -> anyhow::Result<()> {
            self.inner.detach(attachment)
        }
    }

    #[test]
    fn test_cancel_releases_mount() {
        let fs_root = tempdir().unwrap();
        let images = tempdir().unwrap();
        let out = tempdir().unwrap();
        let docker = DockerFixture::create(fs_root.path());
        docker.add_layer("aaaa", None, "cache-base");
        docker.add_container(ID, "aaaa", &[]);

        let disk = disk_image(images.path(), "host.raw");
        let cancel = CancelToken::new();
        let mounter = CancellingMounter {
            inner: DirMounter::new().with_root("host.raw", fs_root.path()),
            cancel: cancel.clone(),
        };
        let config = Config::default();
        let explorer = FixtureExplorer::default();
        let task = Task::new(&config, &mounter, &explorer).with_cancel_token(cancel);

        let job = ExportJob::new(out.path(), ExportKinds::new(true, false), &config);
        let err = task.run_export(&[disk], &job).unwrap_err();
        assert!(matches!(err, ForensicsError::Cancelled));
        assert_eq!(mounter.inner.attached.get(), 1);
        assert_eq!(mounter.inner.detached.get(), 1);
        assert!(fs::read_dir(out.path()).unwrap().next().is_none());
    }
}
