pub mod subscriber_repo;
