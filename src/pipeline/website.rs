//! Website stage worker: replaces the published stats files inside a git
//! working copy, pushes the work branch and opens a pull request against
//! the website repository.
//!
//! Idempotent per job: there is exactly one WebsiteUpdate row, and a
//! COMPLETED row is never reprocessed. "Completed" means a pull request was
//! opened or no change was required; landing the PR is a human step.

use std::path::{Path, PathBuf};

use chrono::Utc;
use git2::build::RepoBuilder;
use git2::{BranchType, Cred, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository, Signature};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, info, warn};

use crate::config::{Settings, WebsiteSettings};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::models::{ExportKind, ExportState, JobStatus, StageStatus, WebsiteUpdateStatus};
use crate::services::github::{url_with_token, GitHubAppClient, PullRequest};
use crate::services::ObjectStore;

const COMMITTER_NAME: &str = "ipa-orchestrator";
const COMMITTER_EMAIL: &str = "ipa-orchestrator[bot]@users.noreply.github.com";

/// Run the website stage for one job.
pub async fn run_website_stage(
    db: &DbPool,
    storage: Option<&ObjectStore>,
    job_id: &str,
    settings: &Settings,
) -> AppResult<()> {
    let job = db.require_job(job_id).await?;

    if JobStatus::parse(&job.job_status) != Some(JobStatus::Running) {
        debug!("Skipping website update: job already finished");
        return Ok(());
    }
    if !matches!(
        StageStatus::parse(&job.stats_export_status),
        Some(StageStatus::Completed) | Some(StageStatus::Failed)
    ) {
        debug!("Skipping website update: stats export not finished");
        return Ok(());
    }
    let running_tables = db
        .count_exports_in_state(job_id, ExportKind::Table, ExportState::Running)
        .await?;
    if running_tables > 0 {
        debug!("Skipping website update: stats exports still running");
        return Ok(());
    }

    let record = db.get_or_create_website_update(job_id).await?;
    if WebsiteUpdateStatus::parse(&record.status) == Some(WebsiteUpdateStatus::Completed) {
        return Ok(());
    }

    // Only successfully produced outputs are copied into the website.
    let completed_tables = db
        .exports_in_state(job_id, ExportKind::Table, ExportState::Completed)
        .await?;
    let files_to_replace: Vec<String> = completed_tables
        .iter()
        .map(|export| format!("{}/{}", export.path.trim_end_matches('/'), export.name))
        .collect();

    if files_to_replace.is_empty() {
        info!("No files to replace; website update complete without a pull request");
        db.complete_website_update(job_id, None, None).await?;
        return Ok(());
    }

    let Some(storage) = storage else {
        warn!("No object store available for website update");
        db.record_website_attempt_failure(job_id, "No object store available")
            .await?;
        return Ok(());
    };

    match publish(storage, &settings.automation.website, &files_to_replace, job_id).await {
        Ok(Some(pr)) => {
            db.complete_website_update(
                job_id,
                Some(pr.id.to_string()),
                Some(pr.html_url.clone()),
            )
            .await?;
        }
        Ok(None) => {
            info!("No changes to push; skipping pull request creation");
            db.complete_website_update(job_id, None, None).await?;
        }
        Err(e) => {
            error!("Website update process failed: {}", e);
            db.record_website_attempt_failure(job_id, &e.to_string())
                .await?;
        }
    }
    Ok(())
}

/// Replace the files in the working copy and open the pull request.
/// Returns `None` when the working tree ended up clean.
async fn publish(
    storage: &ObjectStore,
    website: &WebsiteSettings,
    files_to_replace: &[String],
    job_id: &str,
) -> AppResult<Option<PullRequest>> {
    debug!("Generating git-host app installation token");
    let client = GitHubAppClient::new(&website.github)?;
    let token = client.installation_token().await?;

    // Clone or refresh the working copy and check out the work branch.
    let cfg = website.clone();
    let token_for_git = token.clone();
    let workdir = tokio::task::spawn_blocking(move || ensure_working_copy(&cfg, &token_for_git))
        .await
        .map_err(|e| AppError::Git(format!("Working copy task failed: {}", e)))??;

    // Replace the published stats files inside the working copy.
    debug!("Replacing {} file(s) from the object store", files_to_replace.len());
    let gcs_base = website.gcs_base_assets_path.to_string_lossy().to_string();
    for blob_key in files_to_replace {
        let relative = blob_key
            .strip_prefix(&format!("{}/", gcs_base.trim_matches('/')))
            .unwrap_or(blob_key);
        let local_path = workdir.join(&website.repo_base_assets_path).join(relative);
        if let Err(e) = storage.download_to_file(blob_key, &local_path).await {
            // A missing blob is logged and skipped; the diff decides whether
            // anything is published.
            error!("Error downloading {}: {}", blob_key, e);
        }
    }

    // Commit and push, then open the pull request if anything changed.
    let cfg = website.clone();
    let token_for_push = token.clone();
    let job = job_id.to_string();
    let commit_id = tokio::task::spawn_blocking(move || {
        commit_and_push(&workdir, &cfg, &token_for_push, &job)
    })
    .await
    .map_err(|e| AppError::Git(format!("Commit task failed: {}", e)))??;

    let Some(commit_id) = commit_id else {
        return Ok(None);
    };
    debug!("Pushed commit {}", commit_id);

    let now = Utc::now().format("%Y-%m-%d %H:%M");
    let pr = client
        .create_pull_request(
            &token,
            &format!("Automated stats update {}", now),
            &format!(
                "Automated update (replacement) of stats files. Job ID: {}",
                job_id
            ),
            &website.work_branch,
            &website.main_branch,
        )
        .await?;
    Ok(Some(pr))
}

fn credential_callbacks(token: &SecretString) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let secret = token.expose_secret().to_string();
    callbacks.credentials(move |_url, _username, _allowed| {
        Cred::userpass_plaintext("x-access-token", &secret)
    });
    callbacks
}

/// Derive the checkout directory: `<local_repo_path>/<repo name>`.
fn checkout_dir(website: &WebsiteSettings) -> PathBuf {
    let stem = website
        .github
        .repo_url
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or("website")
        .to_string();
    website.local_repo_path.join(stem)
}

/// Clone the repository if absent, else fetch. Check out (or create from
/// the tracked mainline) the work branch and merge the mainline into it to
/// avoid divergence. Returns the working directory.
fn ensure_working_copy(website: &WebsiteSettings, token: &SecretString) -> AppResult<PathBuf> {
    let path = checkout_dir(website);

    let repo = if path.join(".git").exists() {
        debug!("Working copy exists at {}, fetching", path.display());
        let repo = Repository::open(&path)?;
        {
            let mut remote = repo.find_remote("origin")?;
            let both = [website.main_branch.as_str(), website.work_branch.as_str()];
            let mut fetch_options = FetchOptions::new();
            fetch_options.remote_callbacks(credential_callbacks(token));
            let fetched = remote.fetch(&both, Some(&mut fetch_options), None);
            if fetched.is_err() {
                // The work branch may not exist on the remote yet.
                let main_only = [website.main_branch.as_str()];
                let mut fetch_options = FetchOptions::new();
                fetch_options.remote_callbacks(credential_callbacks(token));
                remote.fetch(&main_only, Some(&mut fetch_options), None)?;
            }
        }
        repo
    } else {
        info!("Cloning repository to {}", path.display());
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(credential_callbacks(token));
        let url = url_with_token(&website.github.repo_url, token);
        RepoBuilder::new()
            .fetch_options(fetch_options)
            .clone(&url, &path)?
    };

    checkout_work_branch(&repo, &website.work_branch, &website.main_branch)?;
    merge_mainline(&repo, &website.work_branch, &website.main_branch)?;

    let workdir = repo
        .workdir()
        .ok_or_else(|| AppError::Git("Repository has no working directory".to_string()))?
        .to_path_buf();
    Ok(workdir)
}

/// Check out the work branch, creating it from the remote work branch or
/// from the mainline when it does not exist locally.
fn checkout_work_branch(repo: &Repository, work: &str, main: &str) -> AppResult<()> {
    if repo.find_branch(work, BranchType::Local).is_err() {
        let start_ref = repo
            .find_reference(&format!("refs/remotes/origin/{}", work))
            .or_else(|_| repo.find_reference(&format!("refs/remotes/origin/{}", main)))?;
        let commit = start_ref.peel_to_commit()?;
        repo.branch(work, &commit, false)?;
    }
    repo.set_head(&format!("refs/heads/{}", work))?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))?;
    Ok(())
}

/// Merge the remote mainline into the checked-out work branch.
fn merge_mainline(repo: &Repository, work: &str, main: &str) -> AppResult<()> {
    let mainline = repo.find_reference(&format!("refs/remotes/origin/{}", main))?;
    let annotated = repo.reference_to_annotated_commit(&mainline)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated])?;

    if analysis.is_up_to_date() {
        return Ok(());
    }

    if analysis.is_fast_forward() {
        let mut branch_ref = repo.find_reference(&format!("refs/heads/{}", work))?;
        branch_ref.set_target(annotated.id(), "fast-forward from mainline")?;
        repo.set_head(&format!("refs/heads/{}", work))?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))?;
        return Ok(());
    }

    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    repo.merge(
        &[&annotated],
        None,
        Some(&mut checkout),
    )?;
    let mut index = repo.index()?;
    if index.has_conflicts() {
        repo.cleanup_state()?;
        return Err(AppError::Git(format!(
            "Merge of '{}' into '{}' produced conflicts",
            main, work
        )));
    }
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let signature = Signature::now(COMMITTER_NAME, COMMITTER_EMAIL)?;
    let head_commit = repo.head()?.peel_to_commit()?;
    let merged_commit = repo.find_commit(annotated.id())?;
    repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        &format!("Merge branch '{}' into {}", main, work),
        &tree,
        &[&head_commit, &merged_commit],
    )?;
    repo.cleanup_state()?;
    Ok(())
}

/// Stage all changes; when the tree is dirty, commit and push the work
/// branch. Returns the commit id, or `None` when there was nothing to
/// commit.
fn commit_and_push(
    workdir: &Path,
    website: &WebsiteSettings,
    token: &SecretString,
    job_id: &str,
) -> AppResult<Option<String>> {
    let repo = Repository::open(workdir)?;

    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let head_commit = repo.head()?.peel_to_commit()?;
    if head_commit.tree_id() == tree_id {
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let signature = Signature::now(COMMITTER_NAME, COMMITTER_EMAIL)?;
    let message = format!(
        "Update stats files from GCS ({})\n\nJob ID: {}",
        Utc::now().format("%Y-%m-%d %H:%M"),
        job_id
    );
    let commit_id = repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        &message,
        &tree,
        &[&head_commit],
    )?;

    let url = url_with_token(&website.github.repo_url, token);
    let mut remote = repo.remote_anonymous(&url)?;
    let mut push_options = PushOptions::new();
    push_options.remote_callbacks(credential_callbacks(token));
    let refspec = format!(
        "refs/heads/{branch}:refs/heads/{branch}",
        branch = website.work_branch
    );
    remote.push(&[&refspec], Some(&mut push_options))?;
    info!("Pushed changes to branch {}", website.work_branch);

    Ok(Some(commit_id.to_string()))
}
