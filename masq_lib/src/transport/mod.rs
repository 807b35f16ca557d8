pub mod masque;
