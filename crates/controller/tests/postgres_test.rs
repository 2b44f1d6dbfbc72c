//! Storage tests against a live PostgreSQL database
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`

use ops_controller::listing::{ListingQuery, Pagination};
use ops_controller::models::{DeploymentChanges, NewDeployment, ScalingBounds};
use ops_controller::storage::{DeploymentStore, ImageStore};
use ops_controller::PgStorage;
use uuid::Uuid;

async fn storage() -> PgStorage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let storage = PgStorage::connect(&url, 2).await.unwrap();
    storage.migrate().await.unwrap();
    storage
}

/// A unique owner per test run so runs do not see each other's rows
fn owner() -> String {
    format!("{}@example.com", Uuid::new_v4().simple())
}

fn new_deployment(owner: &str, name: &str, image: &str) -> NewDeployment {
    NewDeployment {
        name: name.to_string(),
        url: String::new(),
        container_image: image.to_string(),
        user_email: owner.to_string(),
        scaling: ScalingBounds::default(),
    }
}

#[tokio::test]
#[ignore]
async fn test_deployment_lifecycle() {
    let storage = storage().await;
    let owner = owner();
    let image = format!("us-central1-docker.pkg.dev/acme/apps/api:{}", &Uuid::new_v4().simple().to_string()[..8]);

    storage.record_image(&image, &owner).await.unwrap();
    assert!(storage.image_exists(&image).await.unwrap());

    let inserted = storage
        .insert(&new_deployment(&owner, "api", &image))
        .await
        .unwrap();
    assert_eq!(inserted.url, "");
    assert_eq!(inserted.max_instances, 1);

    // Same (name, owner) is unique
    assert!(storage
        .insert(&new_deployment(&owner, "api", &image))
        .await
        .is_err());

    let updated = storage
        .update(
            inserted.id,
            &DeploymentChanges {
                container_image: image.clone(),
                scaling: ScalingBounds::from_request(Some(1), Some(4)).unwrap(),
                url: Some("https://api-x1.a.run.app".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.id, inserted.id);
    assert_eq!(updated.url, "https://api-x1.a.run.app");
    assert!(updated.updated_at >= inserted.updated_at);

    // An unknown address leaves the stored one alone
    let unchanged = storage
        .update(
            inserted.id,
            &DeploymentChanges {
                container_image: image.clone(),
                scaling: ScalingBounds::default(),
                url: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(unchanged.url, "https://api-x1.a.run.app");

    let found = storage.find("api", &owner).await.unwrap().unwrap();
    assert_eq!(found.id, inserted.id);
    assert!(storage.find("api", "someone-else@example.com").await.unwrap().is_none());

    assert!(storage.delete(inserted.id).await.unwrap());
    assert!(!storage.delete(inserted.id).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_listing_filters_and_paginates() {
    let storage = storage().await;
    let owner = owner();
    let image = format!("us-central1-docker.pkg.dev/acme/apps/web:{}", &Uuid::new_v4().simple().to_string()[..8]);
    storage.record_image(&image, &owner).await.unwrap();

    for i in 0..12 {
        storage
            .insert(&new_deployment(&owner, &format!("svc-{:02}", i), &image))
            .await
            .unwrap();
    }
    storage
        .insert(&new_deployment(&owner, "100%_literal", &image))
        .await
        .unwrap();

    let second_page = storage
        .list(&ListingQuery::new(
            owner.as_str(),
            None,
            Pagination::from_raw(Some("2"), Some("5")),
        ))
        .await
        .unwrap();
    assert_eq!(second_page.total, 13);
    let names: Vec<&str> = second_page.deployments.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["svc-04", "svc-05", "svc-06", "svc-07", "svc-08"]);

    let searched = storage
        .list(&ListingQuery::new(
            owner.as_str(),
            Some("SVC-1"),
            Pagination::default(),
        ))
        .await
        .unwrap();
    assert_eq!(searched.total, 2);

    // Wildcards in the term match literally
    let literal = storage
        .list(&ListingQuery::new(owner.as_str(), Some("%_"), Pagination::default()))
        .await
        .unwrap();
    assert_eq!(literal.total, 1);
    assert_eq!(literal.deployments[0].name, "100%_literal");

    for deployment in storage
        .list(&ListingQuery::new(
            owner.as_str(),
            None,
            Pagination::from_raw(None, Some("100")),
        ))
        .await
        .unwrap()
        .deployments
    {
        storage.delete(deployment.id).await.unwrap();
    }
}

#[tokio::test]
#[ignore]
async fn test_ping() {
    storage().await.ping().await.unwrap();
}
