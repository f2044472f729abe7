// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terraform argument grammar shared by every backend.

/// Name of the saved plan file inside the working directory.
pub const PLAN_FILE: &str = "plan";

/// Inputs of a `terraform plan`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanRequest {
    /// Add `-destroy`.
    pub destroy: bool,
    /// `--target` addresses in order.
    pub targets: Vec<String>,
    /// `-replace` addresses in order.
    pub replace_addresses: Vec<String>,
}

fn parallelism_arg(parallelism: Option<i32>) -> Option<String> {
    parallelism.map(|n| format!("-parallelism={n}"))
}

fn words(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// `<words...> [-state=<path>]`, the prefix of every one-shot command.
fn with_state(command: &[&str], state_path: Option<&str>) -> Vec<String> {
    let mut args = words(command);
    if let Some(path) = state_path {
        args.push(format!("-state={path}"));
    }
    args
}

/// `init -input=false`
pub fn init() -> Vec<String> {
    words(&["init", "-input=false"])
}

/// `workspace select -or-create=true <name>`
pub fn select_workspace(name: &str) -> Vec<String> {
    let mut args = words(&["workspace", "select", "-or-create=true"]);
    args.push(name.to_string());
    args
}

/// `plan -input=false -out=plan [-parallelism=N] [-destroy] [--target=X]* [-replace=Y]*`
pub fn plan(request: &PlanRequest, parallelism: Option<i32>) -> Vec<String> {
    let mut args = words(&["plan", "-input=false"]);
    args.push(format!("-out={PLAN_FILE}"));
    args.extend(parallelism_arg(parallelism));
    if request.destroy {
        args.push("-destroy".to_string());
    }
    args.extend(request.targets.iter().map(|t| format!("--target={t}")));
    args.extend(
        request
            .replace_addresses
            .iter()
            .map(|r| format!("-replace={r}")),
    );
    args
}

/// `apply [-parallelism=N] plan`
pub fn apply(parallelism: Option<i32>) -> Vec<String> {
    let mut args = vec!["apply".to_string()];
    args.extend(parallelism_arg(parallelism));
    args.push(PLAN_FILE.to_string());
    args
}

/// `show -json [plan | <state path>]`
///
/// `show` takes the file to render positionally instead of via `-state`.
pub fn show(plan: bool, state_path: Option<&str>) -> Vec<String> {
    let mut args = words(&["show", "-json"]);
    if plan {
        args.push(PLAN_FILE.to_string());
    } else if let Some(path) = state_path {
        args.push(path.to_string());
    }
    args
}

/// `taint [-state=<path>] <address>`
pub fn taint(address: &str, state_path: Option<&str>) -> Vec<String> {
    let mut args = with_state(&["taint"], state_path);
    args.push(address.to_string());
    args
}

/// `untaint [-state=<path>] <address>`
pub fn untaint(address: &str, state_path: Option<&str>) -> Vec<String> {
    let mut args = with_state(&["untaint"], state_path);
    args.push(address.to_string());
    args
}

/// `state rm [-state=<path>] <address>...`
pub fn remove_resources(addresses: &[String], state_path: Option<&str>) -> Vec<String> {
    let mut args = with_state(&["state", "rm"], state_path);
    args.extend(addresses.iter().cloned());
    args
}

/// `import [-state=<path>] -input=false <address> <id>`
pub fn import(address: &str, id: &str, state_path: Option<&str>) -> Vec<String> {
    let mut args = with_state(&["import"], state_path);
    args.push("-input=false".to_string());
    args.push(address.to_string());
    args.push(id.to_string());
    args
}

/// `refresh [-state=<path>] -input=false [-parallelism=N]`
pub fn refresh(parallelism: Option<i32>, state_path: Option<&str>) -> Vec<String> {
    let mut args = with_state(&["refresh"], state_path);
    args.push("-input=false".to_string());
    args.extend(parallelism_arg(parallelism));
    args
}

/// `output [-state=<path>] -json`
pub fn outputs(state_path: Option<&str>) -> Vec<String> {
    let mut args = with_state(&["output"], state_path);
    args.push("-json".to_string());
    args
}
