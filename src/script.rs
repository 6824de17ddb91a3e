use crate::models::{JobSpec, SolutionIdentity};

static RUNTIME_ENV: &str = "album-nexus";
static SOLUTION_BIN: &str = "album";
static WALL_CLOCK_LIMIT: &str = "24:00:00";

pub fn job_name(identity: &SolutionIdentity) -> String {
  sanitize_job_name(&identity.coordinate())
}

// Shell-safe: anything outside [A-Za-z0-9._-] becomes an underscore.
pub fn sanitize_job_name(raw: &str) -> String {
  raw
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
    .collect()
}

pub fn output_file_name(job_name: &str, job_id: &str) -> String {
  format!("{job_name}_{job_id}.out")
}

pub fn build_script(spec: &JobSpec) -> String {
  let name = job_name(&spec.identity);
  let mut script = String::new();
  script.push_str("#!/bin/bash\n");
  script.push_str(&format!("#SBATCH --job-name={name}\n"));
  script.push_str(&format!("#SBATCH --output={name}_%j.out\n"));
  script.push_str(&format!("#SBATCH --error={name}_%j.err\n"));
  script.push_str(&format!("#SBATCH --time={WALL_CLOCK_LIMIT}\n"));
  if spec.resources.gpus > 0 {
    script.push_str(&format!("#SBATCH --gpus={}\n", spec.resources.gpus));
    script.push_str("#SBATCH --partition=gpu\n");
  }
  script.push_str("#SBATCH --nodes=1\n");
  script.push_str(&format!("#SBATCH --cpus-per-task={}\n", spec.resources.cpus));
  script.push_str("#SBATCH --ntasks-per-node=1\n");
  script.push_str(&format!("#SBATCH --mem={}\n", spec.resources.memory));
  script.push('\n');
  script.push_str(&format!("micromamba activate {RUNTIME_ENV}\n"));
  script.push('\n');
  script.push_str(&command_line(spec));
  script.push('\n');
  script
}

pub fn command_line(spec: &JobSpec) -> String {
  let mut command = format!("{SOLUTION_BIN} run {}", spec.identity.coordinate());
  for (name, value) in &spec.arguments {
    command.push_str(&format!(" --{} {}", name, quote(value)));
  }
  command
}

fn quote(value: &str) -> String {
  let clean: String = value.chars().filter(|c| *c != '\0').collect();
  shlex::try_quote(&clean)
    .map(|quoted| quoted.into_owned())
    .unwrap_or(clean)
}
