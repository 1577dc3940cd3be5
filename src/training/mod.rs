pub mod minimization;
