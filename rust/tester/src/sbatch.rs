//! Launch script rendering.
//!
//! The script allocates `nodes × gpu_per_node` tasks, announces the host list
//! on the captured stream (`hosts ...`), then starts one worker per task.

use std::{fmt::Write as _, path::Path};

use gpu_tester_config::TestRunConfig;

/// Port the data-parallel worker uses for its rendezvous.
const MASTER_PORT: u16 = 12802;

/// Environment for the EFA/NCCL stack on the GPU partitions.
const ENVIRONMENT: &str = r#"module load intelmpi
source /opt/intel/mpi/latest/env/vars.sh
export LD_LIBRARY_PATH=/opt/aws-ofi-nccl/lib:/opt/amazon/efa/lib64:/usr/local/cuda-11.0/efa/lib:/usr/local/cuda-11.0/lib:/usr/local/cuda-11.0/lib64:/usr/local/cuda-11.0:/opt/nccl/build/lib:/opt/aws-ofi-nccl-install/lib:$LD_LIBRARY_PATH
export PATH=/opt/amazon/efa/bin:$PATH
export LD_PRELOAD="/opt/nccl/build/lib/libnccl.so"

export NCCL_PROTO=simple
export NCCL_TREE_THRESHOLD=0
export NCCL_DEBUG=info
export FI_PROVIDER=efa
export FI_EFA_FORK_SAFE=1
export FI_EFA_USE_DEVICE_RDMA=1
export FI_EFA_ENABLE_SHM_TRANSFER=0
export FI_EFA_TX_MIN_CREDITS=64
export FI_LOG_LEVEL=1

export PYTHONFAULTHANDLER=1
export CUDA_LAUNCH_BLOCKING=0
export TORCH_CPP_LOG_LEVEL=INFO
export TORCH_DISTRIBUTED_DEBUG=INFO"#;

/// Render the batch script for one run. Deterministic in its inputs.
#[must_use]
pub fn render(config: &TestRunConfig, output_file: &Path) -> String {
    let mut script = String::from("#!/bin/bash\n");

    // `write!` into a String cannot fail.
    let _ = writeln!(script, "#SBATCH --partition={}", config.partition);
    let _ = writeln!(script, "#SBATCH --job-name={}", config.job_name);
    let _ = writeln!(script, "#SBATCH --nodes {}", config.nodes);
    let _ = writeln!(script, "#SBATCH --ntasks-per-node {}", config.gpu_per_node);
    let _ = writeln!(script, "#SBATCH --gres=gpu:{}", config.gpu_per_node);
    let _ = writeln!(script, "#SBATCH --output={}", output_file.display());
    script.push_str("#SBATCH --exclusive\n");
    if let Some(ref comment) = config.job_comment {
        let _ = writeln!(script, "#SBATCH --comment {comment}");
    }
    if let Some(ref account) = config.account {
        let _ = writeln!(script, "#SBATCH --account={account}");
    }
    if let Some(ref nodelist) = config.nodelist {
        let _ = writeln!(script, "#SBATCH --nodelist={nodelist}");
    }
    if let Some(ref exclude) = config.exclude {
        let _ = writeln!(script, "#SBATCH --exclude={exclude}");
    }

    script.push('\n');
    script.push_str(ENVIRONMENT);
    script.push_str("\n\n");

    script.push_str("export HOSTNAMES=`scontrol show hostnames \"$SLURM_JOB_NODELIST\"`\n");
    script.push_str("echo hosts $HOSTNAMES\n");
    script.push_str(
        "export MASTER_ADDR=$(scontrol show hostnames \"$SLURM_JOB_NODELIST\" | head -n 1)\n",
    );
    let _ = writeln!(script, "export MASTER_PORT={MASTER_PORT}");
    script.push_str(
        "export COUNT_NODE=`scontrol show hostnames \"$SLURM_JOB_NODELIST\" | wc -l`\n",
    );
    script.push_str("echo go $COUNT_NODE\n\n");

    if let Some(ref venv) = config.venv {
        let _ = writeln!(script, "source {venv}/bin/activate\n");
    }

    let comment = config
        .job_comment
        .as_ref()
        .map(|c| format!("--comment {c} "))
        .unwrap_or_default();
    let _ = writeln!(
        script,
        "srun {comment}--cpu_bind=v --accel-bind=gn python -m gpu_tester.{}",
        config.test_kind.worker_module()
    );

    script
}
