use libhako::LimitSpec;
use libhako::cgroup::{CgroupLayout, shares_to_weight};

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;
    use std::fs;
    use tempfile::TempDir;

    lazy_static::lazy_static! {
        static ref FULL_LIMITS: LimitSpec = LimitSpec::new(512 * 1024 * 1024, 512, 50_000, 100);
    }

    fn v2_fixture() -> (TempDir, CgroupLayout) {
        let temp = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp.path().join("cgroup.controllers"), "cpu memory pids")
            .expect("Failed to seed controllers file");
        let layout = CgroupLayout::probe_at(temp.path());
        (temp, layout)
    }

    fn v1_fixture() -> (TempDir, CgroupLayout) {
        let temp = TempDir::new().expect("Failed to create temp dir");
        for subtree in ["memory", "cpu", "pids"] {
            fs::create_dir(temp.path().join(subtree)).expect("Failed to seed controller subtree");
        }
        let layout = CgroupLayout::probe_at(temp.path());
        (temp, layout)
    }

    fn read(path: impl AsRef<std::path::Path>) -> String {
        fs::read_to_string(path).expect("control file should exist")
    }

    #[test]
    fn probe_detects_v2_by_controllers_file() {
        let (temp, layout) = v2_fixture();
        assert_eq!(
            layout,
            CgroupLayout::V2 {
                root: temp.path().to_path_buf()
            }
        );
    }

    #[test]
    fn probe_detects_v1_by_memory_subtree() {
        let (temp, layout) = v1_fixture();
        assert_eq!(
            layout,
            CgroupLayout::V1 {
                root: temp.path().to_path_buf()
            }
        );
    }

    #[test]
    fn probe_degrades_without_cgroup_support() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        assert_eq!(CgroupLayout::probe_at(temp.path()), CgroupLayout::Disabled);
    }

    #[test]
    fn v2_attach_writes_translated_limits() {
        let (temp, layout) = v2_fixture();
        layout
            .attach(Pid::from_raw(4242), &FULL_LIMITS, "box_1")
            .expect("attach should succeed");

        let node = temp.path().join("box_1");
        // The invariant is what the kernel would read back, so compare
        // file contents rather than metadata.
        assert_eq!(read(node.join("memory.max")), "536870912");
        assert_eq!(read(node.join("cpu.max")), "50000 100000");
        assert_eq!(read(node.join("cpu.weight")), "5000");
        assert_eq!(read(node.join("pids.max")), "100");
        assert_eq!(read(node.join("cgroup.procs")), "4242");
    }

    #[test]
    fn v1_attach_writes_per_controller_nodes() {
        let (temp, layout) = v1_fixture();
        layout
            .attach(Pid::from_raw(4242), &FULL_LIMITS, "box_1")
            .expect("attach should succeed");

        let root = temp.path();
        assert_eq!(
            read(root.join("memory/box_1/memory.limit_in_bytes")),
            "536870912"
        );
        // Shares go through verbatim on v1; no weight mapping.
        assert_eq!(read(root.join("cpu/box_1/cpu.shares")), "512");
        assert_eq!(read(root.join("cpu/box_1/cpu.cfs_quota_us")), "50000");
        assert_eq!(read(root.join("pids/box_1/pids.max")), "100");
        for subtree in ["memory", "cpu", "pids"] {
            assert_eq!(read(root.join(subtree).join("box_1/tasks")), "4242");
        }
    }

    #[test]
    fn zero_limits_only_create_and_enroll() {
        let (temp, layout) = v2_fixture();
        layout
            .attach(Pid::from_raw(7), &LimitSpec::default(), "box_idle")
            .expect("attach should succeed");

        let node = temp.path().join("box_idle");
        assert_eq!(read(node.join("cgroup.procs")), "7");
        assert!(!node.join("memory.max").exists());
        assert!(!node.join("cpu.max").exists());
        assert!(!node.join("cpu.weight").exists());
        assert!(!node.join("pids.max").exists());
    }

    #[test]
    fn zero_limits_create_nothing_on_v1() {
        let (temp, layout) = v1_fixture();
        layout
            .attach(Pid::from_raw(7), &LimitSpec::default(), "box_idle")
            .expect("attach should succeed");
        for subtree in ["memory", "cpu", "pids"] {
            assert!(!temp.path().join(subtree).join("box_idle").exists());
        }
    }

    #[test]
    fn attach_is_deterministic_across_runs() {
        // Limit application commutes over fields: re-attaching the same
        // limits reproduces the same final control-file state.
        let (temp, layout) = v2_fixture();
        let pid = Pid::from_raw(99);
        layout.attach(pid, &FULL_LIMITS, "box_a").unwrap();
        layout.attach(pid, &FULL_LIMITS, "box_a").unwrap();

        let node = temp.path().join("box_a");
        assert_eq!(read(node.join("memory.max")), "536870912");
        assert_eq!(read(node.join("cpu.weight")), "5000");
    }

    #[test]
    fn cleanup_removes_nodes_and_is_idempotent() {
        let (temp, layout) = v1_fixture();
        for subtree in ["memory", "cpu", "pids"] {
            fs::create_dir(temp.path().join(subtree).join("box_gone"))
                .expect("Failed to seed node");
        }

        layout.cleanup("box_gone");
        for subtree in ["memory", "cpu", "pids"] {
            assert!(!temp.path().join(subtree).join("box_gone").exists());
        }

        // Second call is a no-op, not an error.
        layout.cleanup("box_gone");
    }

    #[test]
    fn disabled_layout_accepts_everything() {
        let layout = CgroupLayout::Disabled;
        layout
            .attach(Pid::from_raw(1), &FULL_LIMITS, "ignored")
            .expect("disabled layout must accept attach");
        layout.cleanup("ignored");
        assert!(layout.node_paths("ignored").is_empty());
    }

    #[test]
    fn share_to_weight_conversion_boundaries() {
        assert_eq!(shares_to_weight(1), 9);
        assert_eq!(shares_to_weight(2), 19);
        assert_eq!(shares_to_weight(512), 5000);
        assert_eq!(shares_to_weight(1024), 10_000);
        assert_eq!(shares_to_weight(262_144), 10_000);
    }
}
